//! `HostPlatform`: the native host `AudioPlatform`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use audiokeep_core::config::DEFAULT_MODULES;
use audiokeep_core::{AudioPlatform, ContextOptions, ContextState, PlatformContext, PlatformError};
use tokio::sync::oneshot;

use crate::context::HostContext;
use crate::error::HostError;
use crate::output::OutputKind;
use crate::thread::{self, ThreadSetup};

/// Creates contexts backed by dedicated audio threads.
///
/// Native hosts let audio start without user interaction, so the platform is
/// always interactive and new contexts start running.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    output: OutputKind,
    modules: Arc<[String]>,
    created: Arc<AtomicU64>,
}

impl HostPlatform {
    /// Software-clocked contexts offering the default processing modules.
    pub fn new() -> Self {
        Self::with_output(OutputKind::default())
    }

    pub fn with_output(output: OutputKind) -> Self {
        Self {
            output,
            modules: DEFAULT_MODULES.iter().map(ToString::to_string).collect(),
            created: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the set of processing modules contexts can load.
    #[must_use]
    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub const fn output(&self) -> OutputKind {
        self.output
    }

    /// Contexts created so far.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    async fn spawn_context(&self, options: &ContextOptions) -> Result<HostContext, HostError> {
        let ordinal = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("audiokeep-{}-{ordinal}", options.purpose);
        let state = Arc::new(Mutex::new(ContextState::Initializing));

        let (init_tx, init_rx) = oneshot::channel();
        let (commands, handle) = thread::spawn(
            ThreadSetup {
                name: label.clone(),
                output: self.output,
                sample_rate: options.sample_rate,
                available_modules: Arc::clone(&self.modules),
                state: Arc::clone(&state),
            },
            init_tx,
        )?;

        let clock = match init_rx.await {
            Ok(Ok(clock)) => clock,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(HostError::AudioThreadDied);
            }
        };
        Ok(HostContext::new(label, clock, state, commands, handle))
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioPlatform for HostPlatform {
    fn name(&self) -> &'static str {
        "host"
    }

    fn is_always_interactive(&self) -> bool {
        true
    }

    async fn create(
        &self,
        options: &ContextOptions,
    ) -> Result<Arc<dyn PlatformContext>, PlatformError> {
        let context = self.spawn_context(options).await.map_err(|e| {
            tracing::warn!(purpose = %options.purpose, error = %e, "Host audio context creation failed");
            PlatformError::from(e)
        })?;
        tracing::debug!(
            purpose = %options.purpose,
            thread = context.label(),
            sample_rate = context.sample_rate(),
            latency_hint = ?options.latency_hint,
            "Host audio context created"
        );
        Ok(Arc::new(context))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use audiokeep_core::{Activation, ContextPurpose, LatencyHint};

    use super::*;

    fn options() -> ContextOptions {
        ContextOptions {
            purpose: ContextPurpose::Playback,
            sample_rate: 48_000,
            latency_hint: LatencyHint::Interactive,
        }
    }

    #[tokio::test]
    async fn contexts_start_running_and_render() {
        let platform = HostPlatform::new();
        assert!(platform.is_always_interactive());

        let context = platform.create(&options()).await.unwrap();
        assert_eq!(context.state(), ContextState::Running);
        assert_eq!(context.sample_rate(), 48_000);

        let start = context.current_time();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(context.ping());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(context.current_time() > start);
        assert_eq!(platform.created_count(), 1);
    }

    #[tokio::test]
    async fn suspend_holds_the_clock_and_resume_restarts_it() {
        let context = HostPlatform::new().create(&options()).await.unwrap();

        context.suspend().await.unwrap();
        assert_eq!(context.state(), ContextState::Suspended);
        assert!(!context.ping());
        let held = context.current_time();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!((context.current_time() - held).abs() < f64::EPSILON);

        context.resume(Activation::Autonomous).await.unwrap();
        assert_eq!(context.state(), ContextState::Running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(context.current_time() > held);
    }

    #[tokio::test]
    async fn only_offered_modules_load() {
        let platform = HostPlatform::new().with_modules(["feeder"]);
        let context = platform.create(&options()).await.unwrap();

        context.load_module("feeder").await.unwrap();
        assert!(matches!(
            context.load_module("vad").await,
            Err(PlatformError::ModuleLoad { name, .. }) if name == "vad"
        ));

        let host = context.as_any().downcast_ref::<HostContext>().unwrap();
        assert_eq!(host.loaded_modules().await, vec!["feeder".to_string()]);
    }

    #[tokio::test]
    async fn closed_contexts_reject_further_calls() {
        let context = HostPlatform::new().create(&options()).await.unwrap();

        context.close().await.unwrap();
        assert_eq!(context.state(), ContextState::Closed);
        assert_eq!(context.close().await, Err(PlatformError::Closed));
        assert_eq!(
            context.resume(Activation::Autonomous).await,
            Err(PlatformError::Closed)
        );
        assert!(!context.ping());
    }
}
