use std::sync::OnceLock;

use tokio::sync::watch;
use tracing::{info, warn};

/// Observes a process-wide stop request. Cloning is cheap; every clone sees the same trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal driven by the returned sender. Used by tests and embedders.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. If the trigger side goes away without
    /// firing, this never resolves.
    pub async fn recv(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

static INSTALLED: OnceLock<watch::Receiver<bool>> = OnceLock::new();

/// Installs the SIGINT/SIGTERM listener once per process and returns a signal observing it.
/// The OS handlers are registered before this returns. Must be called from within a tokio
/// runtime.
pub fn install_interrupt_handler() -> ShutdownSignal {
    let rx = INSTALLED.get_or_init(|| {
        let (tx, rx) = watch::channel(false);
        let listener = StopListener::register();
        tokio::spawn(async move {
            listener.wait().await;
            warn!("interrupt received, saving progress");
            let _ = tx.send(true);
            // keep the sender alive so late subscribers still observe the trigger
            std::future::pending::<()>().await;
        });
        info!("interrupt handler installed");
        rx
    });
    ShutdownSignal { rx: rx.clone() }
}

#[cfg(unix)]
struct StopListener {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl StopListener {
    fn register() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let listen = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(signal = name, error = %err, "signal listener unavailable");
                None
            }
        };
        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    async fn wait(mut self) {
        async fn next(stream: Option<&mut tokio::signal::unix::Signal>) {
            match stream {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending().await,
            }
        }
        tokio::select! {
            _ = next(self.interrupt.as_mut()) => {}
            _ = next(self.terminate.as_mut()) => {}
        }
    }
}

#[cfg(not(unix))]
struct StopListener;

#[cfg(not(unix))]
impl StopListener {
    fn register() -> Self {
        Self
    }

    async fn wait(self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn recv_resolves_after_trigger() {
        let (tx, mut signal) = ShutdownSignal::channel();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.recv().await;
            signal.is_triggered()
        });
        tx.send(true).expect("send");
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn a_trigger_before_waiting_is_not_missed() {
        let (tx, mut signal) = ShutdownSignal::channel();
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn never_and_dropped_senders_do_not_fire() {
        let mut never = ShutdownSignal::never();
        assert!(tokio::time::timeout(Duration::from_millis(30), never.recv())
            .await
            .is_err());

        let (tx, mut orphan) = ShutdownSignal::channel();
        drop(tx);
        assert!(tokio::time::timeout(Duration::from_millis(30), orphan.recv())
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_right_after_install_is_observed() {
        let mut signal = install_interrupt_handler();
        assert!(!signal.is_triggered());

        // nothing has yielded to the listener task yet
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("kill");
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), signal.recv())
            .await
            .expect("stop observed");
        assert!(install_interrupt_handler().is_triggered());
    }
}
