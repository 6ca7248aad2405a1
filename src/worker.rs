//! Entry points for sweeps and flash runs, and background workers to run them on.
//!
//! Every port is driven by exactly one worker thread. The result comes back over a channel and
//! cancellation is cooperative: a [CancelToken] is checked between register reads and between
//! flash blocks.

use crate::{
    config::DiagConfig,
    error::{Error, WorkerError},
    firmware::VerifiedImage,
    flash::{FlashResult, Flasher},
    register::RegisterMap,
    session::{DeviceIdentity, DiagnosticSession, SessionController},
    transport::Transport,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read every register in `map` from the pack on `port`.
///
/// A sweep which loses the port still returns a sealed, incomplete session. Only an invalid
/// configuration, or failing to configure the port, is an error.
pub fn run_diagnostic_sweep<S: Transport>(
    port: S,
    map: Arc<RegisterMap>,
    config: &DiagConfig,
) -> crate::error::Result<DiagnosticSession, S::Error> {
    sweep(port, map, config, None, CancelToken::new())
}

/// Program `image` into the MCU on `port`.
pub fn run_firmware_flash<S: Transport>(
    port: S,
    image: VerifiedImage,
    config: &DiagConfig,
) -> crate::error::Result<FlashResult, S::Error> {
    flash(port, image, config, CancelToken::new())
}

fn sweep<S: Transport>(
    port: S,
    map: Arc<RegisterMap>,
    config: &DiagConfig,
    device: Option<DeviceIdentity>,
    cancel: CancelToken,
) -> crate::error::Result<DiagnosticSession, S::Error> {
    config.validate()?;
    let mut controller = SessionController::<S>::new(port, map, config.policy(), config.decoder())?.with_cancel(cancel);
    if let Some(device) = device {
        controller = controller.with_device(device);
    }
    Ok(controller.run())
}

fn flash<S: Transport>(
    port: S,
    image: VerifiedImage,
    config: &DiagConfig,
    cancel: CancelToken,
) -> crate::error::Result<FlashResult, S::Error> {
    config.validate()?;
    let mut flasher = Flasher::<S>::new(port, config.flash, config.policy())?.with_cancel(cancel);
    Ok(flasher.flash(image))
}

/// A running worker thread and the channel its result arrives on.
pub struct WorkerHandle<T> {
    name: String,
    cancel: CancelToken,
    result: mpsc::Receiver<T>,
    thread: JoinHandle<()>,
}

pub type SweepHandle<E> = WorkerHandle<Result<DiagnosticSession, Error<E>>>;
pub type FlashHandle<E> = WorkerHandle<Result<FlashResult, Error<E>>>;

impl<T: Send + 'static> WorkerHandle<T> {
    fn spawn<F>(name: &str, job: F) -> Result<Self, WorkerError>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (sender, result) = mpsc::channel();
        let span_name = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("pack-diag-{name}"))
            .spawn(move || {
                let _span = tracing::info_span!("worker", name = %span_name).entered();
                if sender.send(job(token)).is_err() {
                    tracing::warn!("worker result dropped, handle went away");
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            cancel,
            result,
            thread,
        })
    }
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop at its next safe point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the worker delivers its result.
    pub fn wait(self) -> Result<T, WorkerError> {
        let result = self.result.recv().map_err(|_| WorkerError::Disconnected);
        if self.thread.join().is_err() {
            tracing::error!(worker = %self.name, "worker thread panicked");
        }
        result
    }
}

/// Run a sweep on its own thread.
pub fn spawn_sweep<S>(
    name: &str,
    port: S,
    map: Arc<RegisterMap>,
    config: DiagConfig,
    device: DeviceIdentity,
) -> Result<SweepHandle<S::Error>, WorkerError>
where
    S: Transport + Send + 'static,
    S::Error: Send + 'static,
{
    WorkerHandle::spawn(name, move |cancel| sweep(port, map, &config, Some(device), cancel))
}

/// Run a flash on its own thread.
pub fn spawn_flash<S>(
    name: &str,
    port: S,
    image: VerifiedImage,
    config: DiagConfig,
) -> Result<FlashHandle<S::Error>, WorkerError>
where
    S: Transport + Send + 'static,
    S::Error: Send + 'static,
{
    WorkerHandle::spawn(name, move |cancel| flash(port, image, &config, cancel))
}
