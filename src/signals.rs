use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// A second signal exits immediately, for when rollback itself hangs.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if token.is_cancelled() {
                log::error!("Received signal {signal} again, exiting without cleanup");
                std::process::exit(130);
            }
            log::warn!("Received signal {signal}, cancelling the deployment");
            token.cancel();
        }
    });
    Ok(())
}
