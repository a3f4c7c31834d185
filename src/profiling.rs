//! Feature-gated Chrome tracing via `tracing-chrome`.
//!
//! With the `profiling` feature, [`init`] installs a subscriber that records
//! every span (per stage and per utterance) to `trace.json` in the working
//! directory. Open it in `chrome://tracing` or [Perfetto](https://ui.perfetto.dev).
//!
//! Without the feature, [`init`] returns `None`.

/// Flushes the trace file on drop. Hold it until `main` returns.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Install the Chrome tracing subscriber.
///
/// Returns `None` when the `profiling` feature is off; the caller should then
/// install its own subscriber.
///
/// ```rust,ignore
/// let _guard = voice_resynth::profiling::init();
/// ```
pub fn init() -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file("trace.json")
            .include_args(true)
            .build();

        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!("Profiling enabled, writing trace.json");
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        None
    }
}
