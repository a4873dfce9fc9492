//! Project hooks.
//!
//! A hook is an executable named after the event in `.nimp/hooks/`, looked
//! up in the project directory first and then in the root directory. It
//! runs with every run variable exported as `NIMP_<KEY>`. A missing hook is
//! a success; a hook exiting non-zero fails the caller.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::RunDescriptor;
use crate::error::NimpError;
use crate::process::Cmd;

/// Events that can carry a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreBuild,
    PostBuild,
    PreStage,
    PostStage,
    PreCook,
    PostCook,
    PreRun,
    PostRun,
    DiskFull,
    Status,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::PreBuild => "prebuild",
            Hook::PostBuild => "postbuild",
            Hook::PreStage => "prestage",
            Hook::PostStage => "poststage",
            Hook::PreCook => "precook",
            Hook::PostCook => "postcook",
            Hook::PreRun => "prerun",
            Hook::PostRun => "postrun",
            Hook::DiskFull => "diskfull",
            Hook::Status => "status",
        }
    }
}

/// Locate the hook executable, if the project has one.
pub fn find(hook: Hook, run: &RunDescriptor) -> Option<PathBuf> {
    let mut dirs: Vec<&Path> = Vec::new();
    if let Ok(project) = run.uproject_dir() {
        dirs.push(project);
    }
    dirs.push(run.root_dir());

    let extensions = &run.settings().package.hook_extensions;
    dirs.into_iter().find_map(|dir| {
        let hooks = dir.join(".nimp").join("hooks");
        extensions.iter().find_map(|ext| {
            let candidate = hooks.join(format!("{}{}", hook.name(), ext));
            candidate.is_file().then_some(candidate)
        })
    })
}

/// Run `hook` if present.
pub fn execute(hook: Hook, run: &RunDescriptor) -> Result<()> {
    let Some(path) = find(hook, run) else {
        tracing::debug!("No {} hook", hook.name());
        return Ok(());
    };
    tracing::info!("Found {} hook", hook.name());

    let mut cmd = Cmd::new(path.to_string_lossy()).cwd(run.root_dir()).dry_run(run.dry_run());
    for (key, value) in run.vars().iter() {
        cmd = cmd.env(format!("NIMP_{}", key.to_ascii_uppercase()), value.clone());
    }
    cmd = cmd.env("NIMP_HOOK", hook.name());

    let code = cmd.call()?;
    if code != 0 {
        return Err(anyhow::Error::new(NimpError::tool(
            format!("{} hook", hook.name()),
            code,
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn run_in(root: &Path) -> RunDescriptor {
        RunDescriptor::builder(root).uproject("Game").build()
    }

    #[test]
    fn test_missing_hook_succeeds() {
        let dir = TempDir::new().unwrap();
        assert!(execute(Hook::PreCook, &run_in(dir.path())).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_hook_receives_variables() {
        let dir = TempDir::new().unwrap();
        let hooks = dir.path().join(".nimp/hooks");
        fs::create_dir_all(&hooks).unwrap();
        let script = hooks.join("prestage.sh");
        let marker = dir.path().join("marker");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$NIMP_UPROJECT $NIMP_HOOK\" > {}\n", marker.display()),
        )
        .unwrap();
        crate::fsutil::make_executable(&script).unwrap();

        execute(Hook::PreStage, &run_in(dir.path())).unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "Game prestage");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_hook_fails_caller() {
        let dir = TempDir::new().unwrap();
        let hooks = dir.path().join(".nimp/hooks");
        fs::create_dir_all(&hooks).unwrap();
        let script = hooks.join("postcook");
        fs::write(&script, "#!/bin/sh\nexit 4\n").unwrap();
        crate::fsutil::make_executable(&script).unwrap();

        let err = execute(Hook::PostCook, &run_in(dir.path())).unwrap_err();
        assert_eq!(crate::error::tool_exit_code(&err), Some(4));
    }
}
