//! Re-entrancy-safe linear task sequencer.
//!
//! [`Sender`](crate::sender::Sender), [`Dispatcher`](crate::dispatcher::Dispatcher),
//! and [`Receiver`](crate::receiver::Receiver) each drive a small fixed
//! sequence of named stages (e.g. `dispatch -> complete`) through a
//! [`Pipeline`]. A stage either runs to completion and immediately requests
//! the next stage, or suspends itself by arranging a callback (a worker-task
//! completion, a timer fire, an ACK receive) that later requests `next` or
//! `finish`.
//!
//! A stage requesting `next`/`finish` *while already inside a stage call* is
//! the re-entrant case this type exists to handle safely: rather than
//! recursing (which a naive implementation would do, and which could blow
//! the stack or run two stages concurrently on state that's only half
//! updated), the request is recorded as pending and replayed by the
//! original call's driving loop once it returns. This mirrors the source's
//! BUSY/NEXT_PENDING/FINISH_PENDING flag pattern exactly; see the design
//! notes for why it's kept rather than dropped in favour of pure
//! message-passing.

/// What a driving loop should do after requesting an advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// It's safe to run this stage index right now.
    Run(u8),
    /// The pipeline was busy; the request was recorded and will be replayed
    /// by the in-progress driving loop. The caller must not run anything.
    Deferred,
}

/// The BUSY/NEXT_PENDING/FINISH_PENDING state machine for one pipeline
/// instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pipeline {
    stage: u8,
    busy: bool,
    next_pending: bool,
    finish_pending: bool,
}

impl Pipeline {
    /// Creates a fresh pipeline positioned before stage 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: 0,
            busy: false,
            next_pending: false,
            finish_pending: false,
        }
    }

    /// The stage currently selected (the one last run, or about to run).
    #[must_use]
    pub const fn stage(&self) -> u8 {
        self.stage
    }

    /// `true` if a stage call is currently on the stack (i.e. we are inside
    /// a driving loop's call to a stage function).
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.busy
    }

    /// Begins the pipeline: always runs stage 0. Must only be called once,
    /// before any other method.
    pub fn begin(&mut self) -> Advance {
        debug_assert!(!self.busy && self.stage == 0);
        self.busy = true;
        Advance::Run(self.stage)
    }

    /// Requests advancing to `stage() + 1`.
    pub fn request_next(&mut self) -> Advance {
        if self.busy {
            self.next_pending = true;
            return Advance::Deferred;
        }
        self.busy = true;
        self.stage += 1;
        Advance::Run(self.stage)
    }

    /// Requests jumping straight to `last_stage`, regardless of the current
    /// position. `finish` always wins over a pending `next`.
    pub fn request_finish(&mut self, last_stage: u8) -> Advance {
        if self.busy {
            self.finish_pending = true;
            return Advance::Deferred;
        }
        self.busy = true;
        self.stage = last_stage;
        Advance::Run(self.stage)
    }

    /// Called by a driving loop once the stage function it just ran returns
    /// control. Clears BUSY and, if a `next`/`finish` request queued up while
    /// busy, returns the `Advance` for the driving loop to run in the same
    /// iteration (replaying the most recent intent; `finish` takes priority).
    pub fn end(&mut self, last_stage: u8) -> Option<Advance> {
        self.busy = false;
        if self.finish_pending {
            self.finish_pending = false;
            self.next_pending = false;
            Some(self.request_finish(last_stage))
        } else if self.next_pending {
            self.next_pending = false;
            Some(self.request_next())
        } else {
            None
        }
    }
}

/// Drives a pipeline through repeated calls to `run_stage` until no
/// `next`/`finish` request is pending, starting from an initial [`Advance`].
///
/// `get_pipeline` and `run_stage` both re-borrow their owning context fresh
/// on each call (rather than holding a borrow across the loop), which is
/// what lets a stage function recurse back into `request_next`/
/// `request_finish` without fighting the borrow checker: by the time
/// `run_stage` runs, the mutable borrow used to read `advance` has already
/// ended.
pub fn drive<Ctx>(
    ctx: &mut Ctx,
    last_stage: u8,
    mut advance: Advance,
    get_pipeline: impl Fn(&mut Ctx) -> Option<&mut Pipeline>,
    run_stage: impl Fn(&mut Ctx, u8),
) {
    loop {
        match advance {
            Advance::Deferred => return,
            Advance::Run(stage) => {
                run_stage(ctx, stage);
                let Some(pipeline) = get_pipeline(ctx) else {
                    return;
                };
                match pipeline.end(last_stage) {
                    Some(next) => advance = next,
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A toy three-stage pipeline: stage 1 re-entrantly requests `next`
    /// before returning, exercising the deferred-replay path.
    #[test]
    fn reentrant_next_is_replayed_not_recursed() {
        struct Toy {
            pipeline: Pipeline,
            ran: Vec<u8>,
            reentered: bool,
        }

        fn run_stage(ctx: &mut Toy, stage: u8) {
            ctx.ran.push(stage);
            if stage == 1 && !ctx.reentered {
                ctx.reentered = true;
                // re-entrant call while `ctx.pipeline.busy` is still true
                let advance = ctx.pipeline.request_next();
                assert_eq!(advance, Advance::Deferred);
            }
        }

        let mut toy = Toy {
            pipeline: Pipeline::new(),
            ran: Vec::new(),
            reentered: false,
        };

        let advance = toy.pipeline.begin();
        drive(
            &mut toy,
            2,
            advance,
            |ctx| Some(&mut ctx.pipeline),
            run_stage,
        );
        // stage 0 runs, then next() takes us to 1, which re-entrantly
        // requests next() (deferred), then that gets replayed taking us to 2
        assert_eq!(toy.ran, vec![0]);

        let advance = toy.pipeline.request_next();
        drive(
            &mut toy,
            2,
            advance,
            |ctx| Some(&mut ctx.pipeline),
            run_stage,
        );
        assert_eq!(toy.ran, vec![0, 1, 2]);
        assert_eq!(toy.pipeline.stage(), 2);
    }

    #[test]
    fn finish_jumps_to_last_stage_and_wins_over_next() {
        struct Toy {
            pipeline: Pipeline,
            ran: Vec<u8>,
        }

        fn run_stage(ctx: &mut Toy, stage: u8) {
            ctx.ran.push(stage);
            if stage == 0 {
                let a = ctx.pipeline.request_next();
                assert_eq!(a, Advance::Deferred);
                let b = ctx.pipeline.request_finish(3);
                assert_eq!(b, Advance::Deferred);
            }
        }

        let mut toy = Toy {
            pipeline: Pipeline::new(),
            ran: Vec::new(),
        };
        let advance = toy.pipeline.begin();
        drive(
            &mut toy,
            3,
            advance,
            |ctx| Some(&mut ctx.pipeline),
            run_stage,
        );
        assert_eq!(toy.ran, vec![0, 3]);
    }
}
