use std::sync::Arc;

use crate::helpers::DataSize;

/// Receives user facing progress of long running operations.
pub trait ProgressSink {
    fn println(&self, line: &str);

    fn progress(&self, id: &str, action: &str, current: u64, total: Option<u64>) {
        match total {
            Some(total) => self.println(&format!("{}: {} {}/{}", id, action, DataSize(current), DataSize(total))),
            None => self.println(&format!("{}: {}", id, action))
        }
    }
}

pub type ProgressSinkRef = Arc<dyn ProgressSink + Send + Sync>;

pub struct ConsoleProgress {

}

impl ConsoleProgress {
    pub fn new() -> Arc<ConsoleProgress> {
        Arc::new(ConsoleProgress { })
    }
}

impl ProgressSink for ConsoleProgress {
    fn println(&self, line: &str) {
        println!("{}", line);
    }
}

pub struct EmptyProgress {

}

impl EmptyProgress {
    pub fn new() -> Arc<EmptyProgress> {
        Arc::new(EmptyProgress { })
    }
}

impl ProgressSink for EmptyProgress {
    fn println(&self, _line: &str) {

    }

    fn progress(&self, _id: &str, _action: &str, _current: u64, _total: Option<u64>) {

    }
}
