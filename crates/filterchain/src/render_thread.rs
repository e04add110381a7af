use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Sender};

use crate::camera::CameraSource;
use crate::gpu::BoxedBackend;
use crate::host::{FilterChainHost, HostHandle};
use crate::types::HostConfig;

/// Longest the render thread sleeps without work before re-checking.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Dedicated thread owning a [`FilterChainHost`] and its GPU backend.
pub struct RenderThread {
    handle: HostHandle,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl RenderThread {
    /// Spawns the render thread. `backend` runs on the new thread so the GPU
    /// context is created where it is used.
    pub fn spawn<F>(config: HostConfig, backend: F, camera: Box<dyn CameraSource>) -> Result<Self>
    where
        F: FnOnce() -> Result<BoxedBackend> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded(1);
        let join_handle = thread::Builder::new()
            .name("filterchain-render".into())
            .spawn(move || run_render_thread(config, backend, camera, ready_tx))
            .map_err(|err| anyhow!("failed to spawn render thread: {err}"))?;

        let handle = ready_rx
            .recv()
            .map_err(|err| anyhow!("render thread failed to initialise: {err}"))??;

        Ok(Self {
            handle,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    /// Stops encoding, tears the host down and joins the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(join_handle) = self.join_handle.take() {
            self.handle.disable_encoding();
            self.handle.shutdown();
            join_handle
                .join()
                .map_err(|err| anyhow!("render thread panicked: {err:?}"))??;
        }
        Ok(())
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_render_thread<F>(
    config: HostConfig,
    backend: F,
    camera: Box<dyn CameraSource>,
    ready_tx: Sender<Result<HostHandle>>,
) -> Result<()>
where
    F: FnOnce() -> Result<BoxedBackend>,
{
    let gpu = match backend() {
        Ok(gpu) => gpu,
        Err(err) => {
            let message = format!("failed to create GPU backend: {err:#}");
            let _ = ready_tx.send(Err(anyhow!(message.clone())));
            return Err(anyhow!(message));
        }
    };

    let mut host = FilterChainHost::new(gpu, camera, config);
    if let Err(err) = host.surface_created() {
        let message = format!("failed to create render surface: {err}");
        let _ = ready_tx.send(Err(anyhow!(message.clone())));
        return Err(anyhow!(message));
    }
    let _ = ready_tx.send(Ok(host.handle()));

    loop {
        let report = host.tick();
        if report.shutdown {
            break;
        }
        if report.output.is_none() {
            host.wait_for_work(IDLE_WAIT);
        }
    }
    host.destroy();
    Ok(())
}
