//! Command-line surface (spec.md 6).
//!
//! The only flags this crate cares about are `-X:gc:...` arguments, passed
//! verbatim to [`crate::plan::GcPlan::boot`]. Everything else on the command
//! line belongs to whatever hosts this core, so there is no general
//! CLI-parsing dependency here — just this one small collector.

const GC_PREFIX: &str = "-X:gc:";

/// Pulls every `-X:gc:...` argument out of an iterator of command-line
/// strings, stripping the prefix, in the order they appeared.
///
/// Takes an iterator rather than reading `std::env::args()` directly so
/// callers (and tests) can supply an arbitrary argument list.
pub fn collect_gc_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .filter_map(|arg| {
            let arg = arg.as_ref();
            arg.strip_prefix(GC_PREFIX).map(str::to_string)
        })
        .collect()
}

/// Convenience wrapper over [`collect_gc_args`] for the common case of
/// reading the process's actual command line (the first argument, the
/// executable path, is skipped).
pub fn collect_gc_args_from_env() -> Vec<String> {
    collect_gc_args(std::env::args().skip(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_and_ignores_other_flags() {
        let args = ["--verbose", "-X:gc:heap=64m", "-X:other:thing", "-X:gc:threads=4"];
        let collected = collect_gc_args(args);
        assert_eq!(collected, vec!["heap=64m".to_string(), "threads=4".to_string()]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let empty: [&str; 0] = [];
        assert!(collect_gc_args(empty).is_empty());
    }

    #[test]
    fn preserves_order_of_appearance() {
        let args = ["-X:gc:a", "-X:gc:b", "-X:gc:c"];
        assert_eq!(collect_gc_args(args), vec!["a", "b", "c"]);
    }
}
