//! Deferred-call expansion: the handler body for `Call` effects.
//!
//! Argument programs are resolved left to right as nested computations, then
//! the Kleisli arrow produces the callee program and the stream transfers
//! into it, so this handler's frame never lingers under the callee.

use std::collections::VecDeque;

use crate::continuation::Continuation;
use crate::ctl::{Ctl, Yielded};
use crate::error::Failure;
use crate::kleisli::{CallArg, KleisliRef, ProgramCall};
use crate::program::{ProgramStream, StreamStep};
use crate::store::Store;
use crate::value::Value;

pub(crate) struct KpcStream {
    phase: KpcPhase,
}

enum KpcPhase {
    Start {
        call: Option<ProgramCall>,
        k: Option<Continuation>,
    },
    Args {
        k: Continuation,
        kleisli: KleisliRef,
        resolved: Vec<Value>,
        pending: VecDeque<CallArg>,
    },
    Finished,
}

impl std::fmt::Debug for KpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            KpcPhase::Start { .. } => "Start",
            KpcPhase::Args { .. } => "Args",
            KpcPhase::Finished => "Finished",
        };
        f.debug_struct("KpcStream").field("phase", &phase).finish()
    }
}

impl KpcStream {
    pub(crate) fn new(call: ProgramCall, k: Continuation) -> Self {
        KpcStream {
            phase: KpcPhase::Start {
                call: Some(call),
                k: Some(k),
            },
        }
    }

    fn advance(
        &mut self,
        k: Continuation,
        kleisli: KleisliRef,
        mut resolved: Vec<Value>,
        mut pending: VecDeque<CallArg>,
        incoming: Option<Value>,
    ) -> StreamStep {
        if let Some(value) = incoming {
            resolved.push(value);
        }
        while let Some(arg) = pending.pop_front() {
            match arg {
                CallArg::Value(value) => resolved.push(value),
                CallArg::Expr(expr) => {
                    self.phase = KpcPhase::Args {
                        k,
                        kleisli,
                        resolved,
                        pending,
                    };
                    return StreamStep::Yield(Yielded::Thunk(expr));
                }
            }
        }
        match kleisli.call(resolved) {
            Ok(program) => StreamStep::Yield(Yielded::Ctl(Ctl::TransferCall {
                continuation: k,
                program,
            })),
            Err(failure) => StreamStep::Yield(Yielded::Ctl(Ctl::TransferThrow {
                continuation: k,
                error: failure,
            })),
        }
    }
}

impl ProgramStream for KpcStream {
    fn resume(&mut self, value: Value, _store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, KpcPhase::Finished) {
            KpcPhase::Start { call, k } => {
                let (Some(call), Some(k)) = (call, k) else {
                    return StreamStep::Throw(Failure::raised("call expansion restarted"));
                };
                let ProgramCall { kleisli, args, .. } = call;
                self.advance(k, kleisli, Vec::new(), args.into(), None)
            }
            KpcPhase::Args {
                k,
                kleisli,
                resolved,
                pending,
            } => self.advance(k, kleisli, resolved, pending, Some(value)),
            KpcPhase::Finished => StreamStep::Throw(Failure::raised(
                "call expansion resumed after completion",
            )),
        }
    }

    fn throw(&mut self, error: Failure, _store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, KpcPhase::Finished) {
            // An argument program failed: the failure belongs at the call site.
            KpcPhase::Args { k, .. } => StreamStep::Yield(Yielded::Ctl(Ctl::TransferThrow {
                continuation: k,
                error,
            })),
            _ => StreamStep::Throw(error),
        }
    }

    fn name(&self) -> &str {
        "call-expansion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SegmentId;
    use crate::kleisli::kleisli;
    use crate::program;
    use crate::segment::Segment;

    fn test_continuation() -> Continuation {
        let prompt = crate::ids::PromptId::fresh();
        let seg = Segment::body(prompt, None, vec![prompt]);
        Continuation::capture(&seg, SegmentId::new(0, 0), None)
    }

    #[test]
    fn test_value_args_expand_without_yields() {
        let arrow = kleisli("sum", |args| {
            let total: i64 = args.iter().filter_map(Value::as_int).sum();
            Ok(program::pure(Value::Int(total)))
        });
        let call = ProgramCall::new(arrow, vec![Value::Int(1).into(), Value::Int(2).into()]);
        let mut stream = KpcStream::new(call, test_continuation());
        let mut store = Store::new();

        match stream.resume(Value::Unit, &mut store) {
            StreamStep::Yield(Yielded::Ctl(Ctl::TransferCall { .. })) => {}
            other => panic!("expected TransferCall, got {other:?}"),
        }
    }

    #[test]
    fn test_expr_args_resolve_as_thunks() {
        let arrow = kleisli("first", |args| {
            Ok(program::pure(args.into_iter().next().unwrap_or(Value::Unit)))
        });
        let call = ProgramCall::new(
            arrow,
            vec![CallArg::Expr(program::pure(Value::Int(5)))],
        );
        let mut stream = KpcStream::new(call, test_continuation());
        let mut store = Store::new();

        match stream.resume(Value::Unit, &mut store) {
            StreamStep::Yield(Yielded::Thunk(_)) => {}
            other => panic!("expected Thunk yield, got {other:?}"),
        }
        match stream.resume(Value::Int(5), &mut store) {
            StreamStep::Yield(Yielded::Ctl(Ctl::TransferCall { .. })) => {}
            other => panic!("expected TransferCall, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_arg_program_throws_at_call_site() {
        let arrow = kleisli("unused", |_| Ok(program::pure(Value::Unit)));
        let call = ProgramCall::new(
            arrow,
            vec![CallArg::Expr(program::pure(Value::Unit))],
        );
        let mut stream = KpcStream::new(call, test_continuation());
        let mut store = Store::new();

        let _ = stream.resume(Value::Unit, &mut store);
        match stream.throw(Failure::raised("arg failed"), &mut store) {
            StreamStep::Yield(Yielded::Ctl(Ctl::TransferThrow { error, .. })) => {
                assert_eq!(error.message, "arg failed");
            }
            other => panic!("expected TransferThrow, got {other:?}"),
        }
    }
}
