//! nimp: build, packaging and artifact orchestration for Unreal Engine projects.
//!
//! The library drives the external toolchain (editor cooker, AutomationTool,
//! console SDK packagers, symbol store uploaders) from one immutable
//! [`config::RunDescriptor`] built per invocation.
//!
//! # Layout
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`process`] | Child process launch, output capture, heartbeat, watchdog |
//! | [`fileset`] | Lazy `(source, destination)` enumeration, stash/unstash |
//! | [`artifact`] | Artifact upload, listing, download and install |
//! | [`config`] | Layered `.nimp.toml` loading and placeholder formatting |
//! | [`platform`] | Platform descriptors and aliases |
//! | [`package`] | Cook, stage, package and verify pipeline |
//! | [`symbols`] | Program and shader symbol stores |

pub mod artifact;
pub mod config;
pub mod error;
pub mod fileset;
pub mod fsutil;
pub mod hooks;
pub mod logging;
pub mod package;
pub mod platform;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod status;
pub mod symbols;

pub use error::NimpError;

use std::time::Instant;

/// Wall-clock timer for pipeline phases.
///
/// ```rust,ignore
/// let t = Timer::start("Cook");
/// cook(&configuration)?;
/// t.finish();
/// ```
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Seconds elapsed since [`Timer::start`].
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Log the elapsed time and consume the timer.
    pub fn finish(self) {
        let secs = self.elapsed();
        if secs >= 60.0 {
            tracing::info!("{} finished in {:.1}m", self.name, secs / 60.0);
        } else {
            tracing::info!("{} finished in {:.1}s", self.name, secs);
        }
    }
}
