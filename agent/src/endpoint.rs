use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;

use copperline_db::message::{EndpointKind, EndpointSpec};

/// What a channel is told to bind at construction. `Inband` is the
/// sentinel for media carried through the application with no phone leg.
#[derive(Clone, Debug)]
pub enum EndpointConfig {
    Inband,
    Spec(EndpointSpec),
}

/// The endpoint a channel owns once constructed.
pub enum Endpoint {
    Inband,
    Driver(EndpointDriver),
}

impl Endpoint {
    pub fn is_inband(&self) -> bool {
        matches!(self, Endpoint::Inband)
    }
}

enum DriverCmd {
    Ring { call_id: String },
    Oncall,
    Hangup,
}

/// Handle to a spawned phone driver. The driver task is the boundary to
/// the SIP/IAX2/H323/PSTN stacks; those are external collaborators, so
/// the task only tracks the leg's lifecycle. The owning channel watches
/// `exit` and is linked to the driver for as long as it lives.
pub struct EndpointDriver {
    pub kind: EndpointKind,
    pub data: String,
    tx: mpsc::UnboundedSender<DriverCmd>,
    exit: watch::Receiver<Option<String>>,
}

impl EndpointDriver {
    pub fn start(spec: &EndpointSpec) -> Result<Self> {
        if spec.data.is_empty() && spec.kind != EndpointKind::SipRegistration {
            return Err(anyhow!(
                "endpoint {} needs a destination",
                spec.kind
            ));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (exit_tx, exit) = watch::channel(None);
        let kind = spec.kind;
        let data = spec.data.clone();
        tokio::spawn(async move {
            loop {
                let cmd = match rx.recv().await {
                    Some(cmd) => cmd,
                    // the channel dropped its handle
                    None => break,
                };
                match cmd {
                    DriverCmd::Ring { call_id } => {
                        info!(
                            endpoint = %kind,
                            data = %data,
                            call = %call_id,
                            "endpoint ringing",
                        );
                    }
                    DriverCmd::Oncall => {
                        info!(endpoint = %kind, data = %data, "endpoint oncall");
                    }
                    DriverCmd::Hangup => {
                        let _ = exit_tx.send(Some("hangup".to_string()));
                        break;
                    }
                }
            }
            // dropping exit_tx marks the watch changed for the monitor
        });

        Ok(Self {
            kind: spec.kind,
            data: spec.data.clone(),
            tx,
            exit,
        })
    }

    pub fn ring(&self, call_id: &str) {
        let _ = self.tx.send(DriverCmd::Ring {
            call_id: call_id.to_string(),
        });
    }

    pub fn oncall(&self) {
        let _ = self.tx.send(DriverCmd::Oncall);
    }

    pub fn hangup(&self) {
        let _ = self.tx.send(DriverCmd::Hangup);
    }

    /// Watch that resolves once the driver task exits; the value carries
    /// the exit reason when the driver set one.
    pub fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit.clone()
    }
}

impl EndpointConfig {
    /// Bring up the endpoint for a channel entering prering.
    pub fn start(&self) -> Result<Endpoint> {
        match self {
            EndpointConfig::Inband => Ok(Endpoint::Inband),
            EndpointConfig::Spec(spec) => {
                Ok(Endpoint::Driver(EndpointDriver::start(spec)?))
            }
        }
    }
}
