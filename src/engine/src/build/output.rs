//! Build progress stream.
//!
//! User-visible progress is line-oriented: step banners, ` ---> <id>`
//! markers, and the final `Successfully built`. In JSON mode each line
//! becomes a `{"stream": "..."}` record instead, one per line, so clients
//! can multiplex progress with other job traffic.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared, cloneable sink for build progress.
#[derive(Clone)]
pub struct BuildOutput {
    sink: Arc<Mutex<dyn Write + Send>>,
    json: bool,
}

impl BuildOutput {
    /// Wrap a writer; `json` switches to structured stream records.
    pub fn new(sink: impl Write + Send + 'static, json: bool) -> Self {
        BuildOutput {
            sink: Arc::new(Mutex::new(sink)),
            json,
        }
    }

    /// Plain-text output.
    pub fn plain(sink: impl Write + Send + 'static) -> Self {
        Self::new(sink, false)
    }

    /// Write one line of progress (a newline is appended).
    pub fn line(&self, text: impl AsRef<str>) {
        self.write(&format!("{}\n", text.as_ref()));
    }

    /// Forward raw container output.
    pub fn raw(&self, data: &[u8]) {
        if self.json {
            self.write(&String::from_utf8_lossy(data));
        } else if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(data);
        }
    }

    fn write(&self, text: &str) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        if self.json {
            let record = serde_json::json!({ "stream": text });
            let _ = writeln!(sink, "{}", record);
        } else {
            let _ = sink.write_all(text.as_bytes());
        }
        let _ = sink.flush();
    }
}
