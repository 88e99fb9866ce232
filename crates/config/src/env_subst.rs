/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw config text.
///
/// Unset variables without a fallback are left untouched so the parser
/// reports them in context.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // unterminated: emit verbatim
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(name: &str) -> Option<String> {
        (name == "HOSTGATE_TOKEN").then(|| "abc".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("access_token = \"${HOSTGATE_TOKEN}\"", fake),
            "access_token = \"abc\""
        );
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(substitute_with("port = ${NOPE:-5700}", fake), "port = 5700");
        assert_eq!(substitute_with("${HOSTGATE_TOKEN:-x}", fake), "abc");
    }

    #[test]
    fn leaves_unknown_and_malformed() {
        assert_eq!(substitute_with("${NOPE}", fake), "${NOPE}");
        assert_eq!(substitute_with("${}", fake), "${}");
        assert_eq!(substitute_with("a ${open", fake), "a ${open");
        assert_eq!(substitute_with("plain $text", fake), "plain $text");
    }
}
