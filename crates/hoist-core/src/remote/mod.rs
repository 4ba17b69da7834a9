//! Remote host access over ssh.

pub mod ssh;

pub use ssh::{RemoteShell, SshOptions, SshTarget, is_auth_failure};
