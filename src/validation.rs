use crate::constants::{MAX_TAG_LENGTH, MAX_USER_REQUEST_LENGTH};
use crate::error::OrchestratorError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

static SAFE_CONTENT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "c:\\windows\\system32",
];

/// Validates and sanitizes the one user-supplied free-text surface the core
/// accepts directly: a job's `user_request`, and its `tags`.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl RequestValidator {
    pub fn new() -> Result<Self, OrchestratorError> {
        let safe_content_regex = Regex::new(SAFE_CONTENT_REGEX)
            .map_err(|e| OrchestratorError::Config(format!("invalid regex pattern: {e}")))?;

        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();

        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    pub fn validate_and_sanitize_user_request(
        &self,
        content: &str,
    ) -> Result<String, OrchestratorError> {
        if content.len() > MAX_USER_REQUEST_LENGTH {
            return Err(OrchestratorError::Validation(format!(
                "user_request exceeds maximum length of {MAX_USER_REQUEST_LENGTH} characters"
            )));
        }
        if content.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "user_request cannot be empty".to_string(),
            ));
        }
        self.reject_dangerous(content, "user_request")?;
        if !self.safe_content_regex.is_match(content) {
            return Err(OrchestratorError::Validation(
                "user_request contains invalid characters".to_string(),
            ));
        }
        Ok(encode_text(content).to_string())
    }

    pub fn validate_and_sanitize_tag(&self, tag: &str) -> Result<String, OrchestratorError> {
        if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
            return Err(OrchestratorError::Validation(format!(
                "tag must be non-empty and under {MAX_TAG_LENGTH} characters"
            )));
        }
        self.reject_dangerous(tag, "tag")?;
        if !tag.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(OrchestratorError::Validation(
                "tags can only contain alphanumeric characters, underscores, and hyphens"
                    .to_string(),
            ));
        }
        Ok(encode_text(tag).to_string())
    }

    fn reject_dangerous(&self, content: &str, field: &str) -> Result<(), OrchestratorError> {
        let lower = content.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lower.contains(pattern) {
                return Err(OrchestratorError::Validation(format!(
                    "{field} contains potentially dangerous patterns"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new().expect("static regex must compile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_request() {
        let validator = RequestValidator::new().unwrap();
        assert!(validator
            .validate_and_sanitize_user_request("build an echo service")
            .is_ok());
    }

    #[test]
    fn rejects_script_injection() {
        let validator = RequestValidator::new().unwrap();
        let result = validator
            .validate_and_sanitize_user_request("build <script>alert('xss')</script>");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_command_injection() {
        let validator = RequestValidator::new().unwrap();
        let result = validator.validate_and_sanitize_user_request("do it && rm -rf /");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_request() {
        let validator = RequestValidator::new().unwrap();
        assert!(validator.validate_and_sanitize_user_request("").is_err());
    }

    #[test]
    fn rejects_oversized_request() {
        let validator = RequestValidator::new().unwrap();
        let long = "x".repeat(MAX_USER_REQUEST_LENGTH + 1);
        assert!(validator.validate_and_sanitize_user_request(&long).is_err());
    }

    #[test]
    fn accepts_valid_tags_rejects_invalid() {
        let validator = RequestValidator::new().unwrap();
        assert!(validator.validate_and_sanitize_tag("backend").is_ok());
        assert!(validator.validate_and_sanitize_tag("high-priority").is_ok());
        assert!(validator.validate_and_sanitize_tag("").is_err());
        assert!(validator.validate_and_sanitize_tag("bad tag").is_err());
    }
}
