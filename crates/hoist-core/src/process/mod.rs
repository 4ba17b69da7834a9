//! External process execution and cancellation.

pub mod cancel;
pub mod runner;

pub use cancel::{CancelToken, Interrupt};
pub use runner::{CommandError, CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// Shell-quote one argument for a remote `sh -c` command line.
pub fn sh_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}


#[cfg(test)]
mod tests {
    use super::sh_quote;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(sh_quote("/nix/store/abc-foo-1.0"), "/nix/store/abc-foo-1.0");
        assert_eq!(sh_quote("two words"), "'two words'");
        assert_eq!(sh_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(sh_quote(""), "''");
    }
}
