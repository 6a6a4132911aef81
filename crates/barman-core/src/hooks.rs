//! Hook script dispatch: environment construction and `_retry` exit-code
//! semantics (0 / 62 ABORT_CONTINUE / 63 ABORT_STOP), per spec.md §4.7/§7.
//!
//! Grounded on `compute_tools::compute`'s pattern of shelling out to an
//! external program with a constructed environment and interpreting its
//! exit status, adapted from "run a user-supplied compute hook" to
//! "run a user-supplied lifecycle hook with a stable env var contract".

use std::collections::BTreeMap;
use std::process::Command;

use barman_utils::error::{HOOK_ABORT_CONTINUE, HOOK_ABORT_STOP};
use barman_utils::ServerName;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        }
    }
}

/// What happened when a hook (possibly retried) finished running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Success,
    AbortContinue,
}

#[derive(Debug, Default, Clone)]
pub struct HookEnv {
    vars: BTreeMap<String, String>,
}

impl HookEnv {
    pub fn new(server: &ServerName, phase: Phase, retry: bool) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("BARMAN_SERVER".to_string(), server.to_string());
        vars.insert("BARMAN_PHASE".to_string(), phase.as_str().to_string());
        vars.insert(
            "BARMAN_RETRY".to_string(),
            if retry { "1" } else { "0" }.to_string(),
        );
        vars.insert(
            "BARMAN_VERSION".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        HookEnv { vars }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_opt(mut self, key: &str, value: Option<impl ToString>) -> Self {
        if let Some(v) = value {
            self.vars.insert(key.to_string(), v.to_string());
        }
        self
    }
}

/// Run `script` once (no retry loop), returning its raw exit code. Used
/// for plain `pre_*`/`post_*` hooks, which only ever run once.
fn run_once(script: &str, env: &HookEnv) -> Result<i32> {
    info!("running hook script {script:?}");
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script);
    for (k, v) in &env.vars {
        cmd.env(k, v);
    }
    let status = cmd
        .status()
        .map_err(|e| Error::Config(format!("spawning hook {script:?}: {e}")))?;
    Ok(status.code().unwrap_or(-1))
}

/// Run a non-`_retry` hook. `ABORT_STOP` in a `pre_*` hook aborts the
/// parent operation; in a `post_*` hook it is logged and treated as
/// success, per spec.md §7.
pub fn run_plain(script: Option<&str>, phase: Phase, env: &HookEnv) -> Result<()> {
    let Some(script) = script else {
        return Ok(());
    };
    let code = run_once(script, env)?;
    match code {
        0 => Ok(()),
        HOOK_ABORT_STOP if phase == Phase::Pre => Err(Error::HookAbortStop {
            script: script.to_string(),
        }),
        HOOK_ABORT_STOP => {
            warn!("post hook {script:?} returned ABORT_STOP; continuing (post-hook semantics)");
            Ok(())
        }
        other => {
            warn!("hook {script:?} exited {other}");
            Ok(())
        }
    }
}

/// Run a `_retry` hook up to `max_attempts` times. `0` is success,
/// `62` (ABORT_CONTINUE) stops retrying and continues the outer
/// operation, `63` (ABORT_STOP) stops retrying and aborts it. Any other
/// exit code is retried until the budget is exhausted, at which point it
/// behaves like `ABORT_STOP` for `pre_*` hooks and like `ABORT_CONTINUE`
/// for `post_*` hooks, per spec.md §4.7.
pub fn run_retry(
    script: Option<&str>,
    phase: Phase,
    env: &HookEnv,
    max_attempts: u32,
) -> Result<HookOutcome> {
    let Some(script) = script else {
        return Ok(HookOutcome::Success);
    };
    let retry_env = HookEnv {
        vars: {
            let mut v = env.vars.clone();
            v.insert("BARMAN_RETRY".to_string(), "1".to_string());
            v
        },
    };
    for attempt in 1..=max_attempts.max(1) {
        let code = run_once(script, &retry_env)?;
        match code {
            0 => return Ok(HookOutcome::Success),
            HOOK_ABORT_CONTINUE => return Ok(HookOutcome::AbortContinue),
            HOOK_ABORT_STOP if phase == Phase::Pre => {
                return Err(Error::HookAbortStop {
                    script: script.to_string(),
                })
            }
            HOOK_ABORT_STOP => return Ok(HookOutcome::AbortContinue),
            other if attempt < max_attempts => {
                warn!(
                    "retry hook {script:?} exited {other} (attempt {attempt}/{max_attempts}), retrying"
                );
            }
            other => {
                warn!("retry hook {script:?} exited {other}, budget exhausted");
                return if phase == Phase::Pre {
                    Err(Error::HookAbortStop {
                        script: script.to_string(),
                    })
                } else {
                    Ok(HookOutcome::AbortContinue)
                };
            }
        }
    }
    unreachable!("loop always returns before exhausting max_attempts.max(1) iterations")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_env_carries_required_vars() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Pre, false).with("BARMAN_BACKUP_ID", "20240101T000000");
        assert_eq!(env.vars.get("BARMAN_SERVER").unwrap(), "main");
        assert_eq!(env.vars.get("BARMAN_PHASE").unwrap(), "pre");
        assert_eq!(env.vars.get("BARMAN_RETRY").unwrap(), "0");
        assert_eq!(env.vars.get("BARMAN_BACKUP_ID").unwrap(), "20240101T000000");
    }

    #[test]
    fn plain_pre_hook_success_runs_clean() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Pre, false);
        run_plain(Some("exit 0"), Phase::Pre, &env).unwrap();
    }

    #[test]
    fn plain_pre_hook_abort_stop_errors() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Pre, false);
        let err = run_plain(Some("exit 63"), Phase::Pre, &env).unwrap_err();
        assert!(matches!(err, Error::HookAbortStop { .. }));
    }

    #[test]
    fn plain_post_hook_abort_stop_is_swallowed() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Post, false);
        run_plain(Some("exit 63"), Phase::Post, &env).unwrap();
    }

    #[test]
    fn retry_hook_continues_on_abort_continue() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Pre, false);
        let outcome = run_retry(Some("exit 62"), Phase::Pre, &env, 3).unwrap();
        assert_eq!(outcome, HookOutcome::AbortContinue);
    }

    #[test]
    fn retry_hook_pre_exhaustion_is_abort_stop() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Pre, false);
        let err = run_retry(Some("exit 7"), Phase::Pre, &env, 2).unwrap_err();
        assert!(matches!(err, Error::HookAbortStop { .. }));
    }

    #[test]
    fn retry_hook_post_exhaustion_is_abort_continue() {
        let server = ServerName::from("main");
        let env = HookEnv::new(&server, Phase::Post, false);
        let outcome = run_retry(Some("exit 7"), Phase::Post, &env, 2).unwrap();
        assert_eq!(outcome, HookOutcome::AbortContinue);
    }
}
