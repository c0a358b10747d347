use std::{future::Future, sync::Arc, thread};

use actix_rt::System;
use anyhow::anyhow;
use tokio::{runtime::Runtime, sync::oneshot};
use tracing::{error, warn};

use crate::{
    error::Error,
    history::{HttpHistory, MeetingHistory},
    media::{MediaDevices, ReplaceReport},
    meeting::{MeetingBuilder, MeetingHandle, MeetingView},
    message::MeetingCode,
    peer::{RtcConfig, RtcTransportFactory},
    relay::WsConnector,
};

/// A meeting running on its own thread and actix system, for callers without
/// an async runtime.
pub struct BlockingMeeting {
    handle: MeetingHandle,
    runtime: Option<Runtime>,
    thread: Option<thread::JoinHandle<Result<(), Error>>>,
}

impl std::fmt::Debug for BlockingMeeting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingMeeting")
            .field("handle", &self.handle)
            .finish()
    }
}

impl BlockingMeeting {
    /// Joins `code` (or a fresh meeting) over the relay and transports
    /// described by `config`, and returns once the join has succeeded or
    /// failed.
    pub fn join(
        mut config: RtcConfig,
        code: Option<MeetingCode>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::UnexpectedError(e.into()))?;
        let (tx, rx) = oneshot::channel();
        let thread = thread::spawn(move || {
            let system = System::new();
            system.block_on(async move {
                let history = HttpHistory::from_config(&mut config);
                let transports = Arc::new(RtcTransportFactory::new(&config));
                let mut builder = MeetingBuilder::new(&config.display_name, devices, transports);
                if let Some(code) = code {
                    builder = builder.code(code);
                }
                if let Some(history) = history {
                    builder = builder.history(Arc::new(history) as Arc<dyn MeetingHistory>);
                }
                match builder.join(WsConnector::new(config.base_url())).await {
                    Ok((meeting, handle)) => {
                        let _ = tx.send(Ok(handle));
                        meeting.run().await
                    }
                    Err(e) => {
                        error!(?e, "Joining failed");
                        let _ = tx.send(Err(e));
                        Ok(())
                    }
                }
            })
        });

        let handle = rx
            .blocking_recv()
            .map_err(|_| Error::UnexpectedError(anyhow!("meeting thread exited")))??;
        Ok(Self {
            handle,
            runtime: Some(runtime),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &MeetingHandle {
        &self.handle
    }

    pub fn view(&self) -> MeetingView {
        self.handle.view()
    }

    fn block_on<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match &self.runtime {
            Some(runtime) => runtime.block_on(f),
            None => Err(Error::MeetingEnded),
        }
    }

    pub fn toggle_audio(&self) -> Result<bool, Error> {
        self.block_on(self.handle.toggle_audio())
    }

    pub fn toggle_video(&self) -> Result<ReplaceReport, Error> {
        self.block_on(self.handle.toggle_video())
    }

    pub fn start_screen_share(&self) -> Result<ReplaceReport, Error> {
        self.block_on(self.handle.start_screen_share())
    }

    pub fn stop_screen_share(&self) -> Result<ReplaceReport, Error> {
        self.block_on(self.handle.stop_screen_share())
    }

    pub fn send_chat<S: Into<String>>(&self, text: S) -> Result<(), Error> {
        self.block_on(self.handle.send_chat(text))
    }

    /// Leaves the meeting and waits for its thread to finish.
    pub fn leave(&mut self) -> Result<(), Error> {
        self.block_on(async {
            self.handle.leave().await;
            Ok(())
        })?;
        self.wait()
    }

    /// Blocks until the meeting ends on its own, e.g. when the relay drops.
    pub fn wait(&mut self) -> Result<(), Error> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::UnexpectedError(anyhow!("meeting thread panicked")))?,
            None => Ok(()),
        }
    }
}

impl Drop for BlockingMeeting {
    fn drop(&mut self) {
        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking here would panic. Dropping the handle still ends the
            // session once no other handle is left.
            if self.thread.is_some() {
                warn!("BlockingMeeting dropped inside an async context, not waiting for it");
            }
            if let Some(runtime) = self.runtime.take() {
                runtime.shutdown_background();
            }
            return;
        }
        if self.thread.is_some() {
            if let Err(e) = self.leave() {
                error!(?e, "Meeting ended with an error");
            }
        }
    }
}
