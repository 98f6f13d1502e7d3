//! Cloud resource name validation.

use std::sync::LazyLock;

use regex::Regex;

use super::ProvisionError;

/// Lowercase letter first, lowercase alphanumerics and `-` after, no
/// trailing `-`, 3 to 63 characters.
pub const NAME_PATTERN: &str = r"^[a-z]([-a-z0-9]{1,61}[a-z0-9])$";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(NAME_PATTERN).expect("NAME_PATTERN is a valid regex"));

pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Reject names the provider would refuse, before any call is made.
pub fn validate_name(field: &str, name: &str) -> Result<(), ProvisionError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "{field} '{name}' is invalid: use 3-63 lowercase letters, digits or '-', \
             starting with a letter and not ending with '-'"
        )))
    }
}

/// Accept any existing project id the provider could hand back: non-empty,
/// no whitespace, nothing that would break a URL path segment.
pub fn validate_project_ref(field: &str, project_id: &str) -> Result<(), ProvisionError> {
    let ok = !project_id.is_empty()
        && !project_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#'));
    if ok {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "{field} '{project_id}' is not a valid project id"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("exit-1")]
    #[case("abc")]
    #[case("nave-exit-mx-01")]
    #[case("a1b")]
    fn test_valid_names(#[case] name: &str) {
        assert!(is_valid_name(name), "{name} should be valid");
    }

    #[rstest]
    #[case("Invalid_Name!")]
    #[case("")]
    #[case("ab")]
    #[case("1exit")]
    #[case("exit-")]
    #[case("Exit-1")]
    #[case("exit_1")]
    #[case("exit.1")]
    fn test_invalid_names(#[case] name: &str) {
        assert!(!is_valid_name(name), "{name} should be invalid");
        assert!(matches!(
            validate_name("name", name),
            Err(ProvisionError::Validation(_))
        ));
    }

    #[rstest]
    #[case("p1")]
    #[case("x")]
    #[case("my-project-123456")]
    #[case("example.com:legacy-project")]
    fn test_existing_project_ids_are_accepted(#[case] project_id: &str) {
        assert!(validate_project_ref("projects", project_id).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("p 1")]
    #[case("p1/zones")]
    #[case("p1?x=1")]
    fn test_malformed_project_ids_are_rejected(#[case] project_id: &str) {
        assert!(matches!(
            validate_project_ref("projects", project_id),
            Err(ProvisionError::Validation(_))
        ));
    }

    #[test]
    fn test_name_length_bounds() {
        assert!(is_valid_name(&format!("a{}", "b".repeat(62))));
        assert!(!is_valid_name(&format!("a{}", "b".repeat(63))));
    }
}
