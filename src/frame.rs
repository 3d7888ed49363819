//! Frame types for the continuation stack.
//!
//! Frames must be Clone so continuation capture can snapshot them behind an
//! `Arc`. Native callbacks live in the VM's callback table and are referenced
//! by id; program streams are shared references, consumed one-shot.

use crate::capture::CallSite;
use crate::ids::CallbackId;
use crate::program::ProgramRef;

/// Metadata about the program a `Stream` frame is running.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub name: String,
    pub site: Option<CallSite>,
}

impl CallMeta {
    pub fn named(name: impl Into<String>) -> Self {
        CallMeta {
            name: name.into(),
            site: None,
        }
    }
}

/// A frame in a segment's local stack.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Native return interception: the callback receives the delivered value.
    /// Skipped (and dropped) during unwinding.
    Return { cb: CallbackId },
    /// Recovery scope: swallows an unwinding failure and delivers it as an
    /// `Outcome` value. On normal delivery the value is wrapped in `Ok`.
    Catch,
    /// Cleanup scope: the cleanup program runs on every exit path.
    Finally { cleanup: ProgramRef },
    /// A running program body.
    Stream {
        stream: ProgramRef,
        started: bool,
        meta: Option<CallMeta>,
    },
}

impl Frame {
    pub fn ret(cb: CallbackId) -> Self {
        Frame::Return { cb }
    }

    pub fn stream(stream: ProgramRef) -> Self {
        Frame::Stream {
            stream,
            started: false,
            meta: None,
        }
    }

    pub fn stream_named(stream: ProgramRef, meta: CallMeta) -> Self {
        Frame::Stream {
            stream,
            started: false,
            meta: Some(meta),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Frame::Return { .. } => "return",
            Frame::Catch => "catch",
            Frame::Finally { .. } => "finally",
            Frame::Stream { .. } => "stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program;
    use crate::program::StreamStep;
    use crate::value::Value;

    #[test]
    fn test_frame_describe() {
        let cb = CallbackId::fresh();
        assert_eq!(Frame::ret(cb).describe(), "return");
        assert_eq!(Frame::Catch.describe(), "catch");
    }

    #[test]
    fn test_stream_frame_is_clone() {
        let prog = program::from_fn("noop", |_, _| StreamStep::Return(Value::Unit));
        let frame = Frame::stream(prog);
        let cloned = frame.clone();
        assert_eq!(cloned.describe(), "stream");
    }
}
