//! In-memory stand-in for local `nix` and a remote host reached over `ssh`.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hoist_core::process::{
    CancelToken, CommandError, CommandOutput, CommandRunner, CommandSpec,
};

pub const FOO_V1: &str = "/nix/store/0c7qyx2sz3mzlnx2yhnxdq6nw7f9kwrr-foo-1.0.0";
pub const FOO_V2: &str = "/nix/store/1d8rzy3ta4nam0y3zioyer7ox8g0lxss-foo-2.0.0";

#[derive(Debug, Default)]
pub struct HostState {
    /// Flake reference to (store path, pname) for local builds.
    pub builds: HashMap<String, (String, String)>,
    pub build_delay: Duration,
    pub remote_store: BTreeSet<String>,
    /// Remote profile: package name to active store path.
    pub profile: BTreeMap<String, String>,
    pub copy_failure: Option<String>,
    pub remove_failure: Option<String>,
    pub install_failure: Option<String>,
    /// Remote `nix profile list` fails, as on hosts with an old nix.
    pub list_failure: Option<String>,
    pub calls: Vec<CommandSpec>,
}

/// Emulates `nix build|derivation show|copy` locally and `nix profile list|remove|install`
/// behind `ssh ... -- <command>`.
#[derive(Debug, Clone, Default)]
pub struct FakeNix {
    state: Arc<Mutex<HostState>>,
}

impl FakeNix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build(self, reference: &str, store_path: &str, pname: &str) -> Self {
        self.state.lock().unwrap().builds.insert(
            reference.to_string(),
            (store_path.to_string(), pname.to_string()),
        );
        self
    }

    /// Pretend `path` was installed on the host under `name` earlier.
    pub fn with_active(self, name: &str, path: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.remote_store.insert(path.to_string());
            state.profile.insert(name.to_string(), path.to_string());
        }
        self
    }

    pub fn set_build(&self, reference: &str, store_path: &str, pname: &str) {
        self.state.lock().unwrap().builds.insert(
            reference.to_string(),
            (store_path.to_string(), pname.to_string()),
        );
    }

    /// Make every local build take `delay`.
    pub fn slow_build(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = delay;
    }

    pub fn fail_copy(&self, diagnostic: &str) {
        self.state.lock().unwrap().copy_failure = Some(diagnostic.to_string());
    }

    pub fn fail_remove(&self, diagnostic: &str) {
        self.state.lock().unwrap().remove_failure = Some(diagnostic.to_string());
    }

    pub fn fail_install(&self, diagnostic: &str) {
        self.state.lock().unwrap().install_failure = Some(diagnostic.to_string());
    }

    pub fn fail_list(&self, diagnostic: &str) {
        self.state.lock().unwrap().list_failure = Some(diagnostic.to_string());
    }

    pub fn profile(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().profile.clone()
    }

    pub fn remote_store(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().remote_store.clone()
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Remote command lines sent over ssh, in order.
    pub fn remote_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == "ssh")
            .filter_map(|c| c.args.last().cloned())
            .collect()
    }

    fn local_nix(state: &mut HostState, args: &[String]) -> CommandOutput {
        match args.first().map(String::as_str) {
            Some("build") => {
                let link = &args[3];
                let reference = &args[4];
                match state.builds.get(reference) {
                    Some((path, _)) => {
                        std::fs::write(link, path).unwrap();
                        CommandOutput::success(format!("{path}\n"))
                    }
                    None => CommandOutput::failure(
                        1,
                        format!("error: flake does not provide attribute '{reference}'"),
                    ),
                }
            }
            Some("derivation") => {
                let path = &args[2];
                match state.builds.values().find(|(built, _)| built == path) {
                    Some((_, pname)) => CommandOutput::success(format!(
                        r#"{{"{path}.drv":{{"env":{{"pname":"{pname}"}}}}}}"#
                    )),
                    None => CommandOutput::failure(
                        1,
                        format!("error: path '{path}' does not have a valid deriver"),
                    ),
                }
            }
            Some("copy") => {
                if let Some(diagnostic) = &state.copy_failure {
                    return CommandOutput::failure(1, diagnostic.clone());
                }
                state.remote_store.insert(args[4].clone());
                CommandOutput::success("")
            }
            _ => CommandOutput::failure(1, format!("unexpected nix invocation: {args:?}")),
        }
    }

    fn remote(state: &mut HostState, command: &str) -> CommandOutput {
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["nix", "profile", "list", "--json"] => {
                if let Some(diagnostic) = &state.list_failure {
                    return CommandOutput::failure(1, diagnostic.clone());
                }
                let elements: serde_json::Map<String, serde_json::Value> = state
                    .profile
                    .iter()
                    .map(|(name, path)| {
                        (
                            name.clone(),
                            serde_json::json!({ "active": true, "storePaths": [path] }),
                        )
                    })
                    .collect();
                CommandOutput::success(
                    serde_json::json!({ "version": 3, "elements": elements }).to_string(),
                )
            }
            ["nix", "profile", "remove", name] => {
                if let Some(diagnostic) = &state.remove_failure {
                    return CommandOutput::failure(1, diagnostic.clone());
                }
                match state.profile.remove(*name) {
                    Some(_) => CommandOutput::success(""),
                    None => CommandOutput::failure(
                        1,
                        format!("error: '{name}' does not match any packages in the profile"),
                    ),
                }
            }
            ["nix", "profile", "install", path] => {
                if let Some(diagnostic) = &state.install_failure {
                    return CommandOutput::failure(1, diagnostic.clone());
                }
                if !state.remote_store.contains(*path) {
                    return CommandOutput::failure(1, format!("error: path '{path}' is not valid"));
                }
                let pname = state
                    .builds
                    .values()
                    .find(|(built, _)| built == path)
                    .map(|(_, pname)| pname.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                state.profile.insert(pname, path.to_string());
                CommandOutput::success("")
            }
            _ => CommandOutput::failure(127, format!("sh: unexpected command: {command}")),
        }
    }
}

impl CommandRunner for FakeNix {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        let command = spec.args.first().map(String::as_str);
        if spec.program == "nix" && command == Some("build") {
            let delay = self.state.lock().unwrap().build_delay;
            std::thread::sleep(delay);
        }
        if let Some(reason) = cancel.interrupted() {
            return Err(CommandError::Interrupted {
                program: spec.program.clone(),
                reason,
            });
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(spec.clone());
        Ok(match spec.program.as_str() {
            "nix" => Self::local_nix(&mut state, &spec.args),
            "ssh" => {
                let command = spec.args.last().cloned().unwrap_or_default();
                Self::remote(&mut state, &command)
            }
            other => CommandOutput::failure(127, format!("{other}: command not found")),
        })
    }
}
