use std::io::Write as _;

use tracing::{info, warn};
use tutor_stream::{Entity, StreamError, StreamEvent, StreamHandler};

/// Prints every classified event as one NDJSON line on stdout.
#[derive(Default)]
pub struct PrintHandler {
    pub messages: u64,
    pub failed: bool,
}

impl<E: Entity> StreamHandler<E> for PrintHandler {
    fn on_message(&mut self, event: &StreamEvent<E>) {
        self.messages += 1;
        match event.encode_line() {
            Ok(line) => write_stdout(&line),
            Err(err) => warn!(event = "cli.encode_failed", kind = event.kind(), error = %err),
        }
    }

    fn on_error(&mut self, error: &StreamError) {
        self.failed = true;
        warn!(event = "cli.stream_failed", code = error.code(), error = %error);
    }

    fn on_complete(&mut self, entities: &[E]) {
        let keys: Vec<String> = entities.iter().map(|e| e.key().to_string()).collect();
        info!(
            event = "cli.stream_completed",
            entities = entities.len() as u64,
            keys = %keys.join(","),
            messages = self.messages
        );
    }
}

pub fn write_stdout(bytes: &[u8]) {
    let mut stdout = std::io::stdout().lock();
    if let Err(err) = stdout.write_all(bytes).and_then(|_| stdout.flush()) {
        warn!(event = "cli.stdout_failed", error = %err);
    }
}
