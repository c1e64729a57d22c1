//! One normalization rule for every agent input/announcement stream name.
//! There is deliberately no legacy `_agent`-suffixed alias: discovery and
//! dispatch both go through this single function.

pub fn normalize_agent_type(agent_type: &str) -> &str {
    agent_type.strip_suffix("_agent").unwrap_or(agent_type)
}

pub fn agent_input_stream(agent_type: &str) -> String {
    format!("agent:{}:input", normalize_agent_type(agent_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_agent_suffix() {
        assert_eq!(normalize_agent_type("coding_agent"), "coding");
        assert_eq!(normalize_agent_type("coding"), "coding");
    }

    #[test]
    fn builds_canonical_input_stream_name() {
        assert_eq!(agent_input_stream("coding_agent"), "agent:coding:input");
        assert_eq!(agent_input_stream("coding"), "agent:coding:input");
    }
}
