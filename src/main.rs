mod app;

use app::Args;
use directdrop::utils::sos::SignalOfStop;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // webrtc_ice logs "unknown TransactionID" warnings for late STUN
    // responses, which are normal.
    let filter = match args.verbose {
        0 => "warn,directdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One logical writer: the engine loops share a single thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let sos = SignalOfStop::new();
        sos.cancel_on_ctrl_c();
        app::run(args, sos).await
    })
}
