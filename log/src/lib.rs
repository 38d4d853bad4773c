use std::{io::Write, thread};

use crossbeam_channel::{RecvError, Sender};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt,
};

/// Writer that hands log lines to a dedicated thread so the hot path
/// never blocks on stderr.
pub struct LogWriter {
    sender: Sender<Vec<u8>>,
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1000);
        thread::spawn(move || -> Result<usize, RecvError> {
            let mut stderr = std::io::stderr();
            loop {
                let data: Vec<u8> = receiver.recv()?;
                let _ = stderr.write_all(&data);
            }
        });
        Self { sender }
    }
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.sender.try_send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn init() {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    std::mem::forget(guard);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .parse_lossy(""),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .pretty()
                .compact(),
        )
        .init();
}
