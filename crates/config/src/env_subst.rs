/// Expand `${NAME}` placeholders from the process environment.
///
/// A placeholder naming an unset variable stays in the output verbatim, and
/// an unterminated `${` is copied through unchanged.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
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

    #[test]
    #[allow(unsafe_code)]
    fn expands_set_variable() {
        unsafe { std::env::set_var("CASTLE_SUBST_TEST", "ws://gw:1") };
        assert_eq!(
            substitute_env("url = \"${CASTLE_SUBST_TEST}/ws\""),
            "url = \"ws://gw:1/ws\""
        );
        unsafe { std::env::remove_var("CASTLE_SUBST_TEST") };
    }

    #[test]
    fn keeps_unset_placeholder() {
        assert_eq!(
            substitute_env("token = ${CASTLE_SUBST_UNSET_XYZ}"),
            "token = ${CASTLE_SUBST_UNSET_XYZ}"
        );
    }

    #[test]
    fn copies_unterminated_placeholder() {
        assert_eq!(substitute_env("a ${oops"), "a ${oops");
        assert_eq!(substitute_env("${}"), "${}");
    }
}
