//! Custom macros for reducing code repetition in the mixer

/// Log an error and continue execution (non-fatal error handling)
///
/// # Example
/// ```ignore
/// log_and_continue!(operator.render_plane(0, &mut renderer), "render output 0");
/// ```
#[macro_export]
macro_rules! log_and_continue {
    ($expr:expr, $context:expr) => {
        if let Err(e) = $expr {
            log::error!("Failed to {}: {}", $context, e);
        }
    };
}

/// Validate an enum-like string value
///
/// # Example
/// ```ignore
/// validate_enum!(fade_curve, "linear", "ease-in", "ease-out", "ease-in-out");
/// validate_enum!(format, "UYVY", "NV12", "BGRx");
/// ```
#[macro_export]
macro_rules! validate_enum {
    ($value:expr, $($variant:expr),+) => {
        match $value {
            $($variant)|+ => Ok::<(), anyhow::Error>(()),
            _ => anyhow::bail!("Invalid value: {} (expected one of: {})", $value, [$($variant),+].join(", ")),
        }
    };
}

/// Time a block and log it at debug level (profiling builds only)
///
/// # Example
/// ```ignore
/// let image = profile_scope!("import frame", backend.import(&frame));
/// ```
#[macro_export]
macro_rules! profile_scope {
    ($label:expr, $body:expr) => {{
        #[cfg(feature = "profiling")]
        let __start = std::time::Instant::now();
        let __result = $body;
        #[cfg(feature = "profiling")]
        log::debug!("{} took {:?}", $label, __start.elapsed());
        __result
    }};
}

#[cfg(test)]
mod tests {
    fn check(value: &str) -> anyhow::Result<()> {
        validate_enum!(value, "linear", "ease-in")
    }

    #[test]
    fn test_validate_enum() {
        assert!(check("linear").is_ok());
        let err = check("bounce").unwrap_err().to_string();
        assert!(err.contains("bounce"));
        assert!(err.contains("linear, ease-in"));
    }

    #[test]
    fn test_profile_scope_returns_value() {
        let v = profile_scope!("sum", 2 + 3);
        assert_eq!(v, 5);
    }
}
