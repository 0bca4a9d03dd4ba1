// Frame loop state machine
//
// Idle -> Acquiring -> Recording -> Submitted -> Presenting -> Idle
//
// The loop only sequences a FrameTarget; all GPU work lives behind the
// trait so the protocol (out-of-date handling, deferred resizes, the flush
// after every present) can be driven by a mock in tests.

use anyhow::Result;

use crate::backend::swapchain::{AcquireOutcome, PresentOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    Resized,
    /// Surface extent is zero (minimized); retry next frame.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutOfDate,
    Minimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered { image_index: u32, draw_calls: u32 },
    Skipped(SkipReason),
}

/// Everything a frame needs from the renderer.
pub trait FrameTarget {
    /// Write per-frame uniforms into persistently mapped memory.
    fn update_uniforms(&mut self) -> Result<()>;
    fn acquire(&mut self) -> Result<AcquireOutcome>;
    /// Record the image's command buffer; returns the number of draw calls.
    fn record(&mut self, image_index: u32) -> Result<u32>;
    fn submit(&mut self, image_index: u32) -> Result<()>;
    fn present(&mut self, image_index: u32) -> Result<PresentOutcome>;
    /// Block until the device is idle.
    fn flush(&mut self) -> Result<()>;
    /// Rebuild swapchain-derived resources for the current surface extent.
    fn resize(&mut self) -> Result<ResizeOutcome>;
}

#[derive(Debug)]
pub struct FrameLoop {
    state: FrameState,
    needs_resize: bool,
    frames: u64,
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLoop {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            needs_resize: false,
            frames: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    pub fn resize_pending(&self) -> bool {
        self.needs_resize
    }

    /// Schedule a resize before the next frame (window resized, suboptimal chain).
    pub fn request_resize(&mut self) {
        self.needs_resize = true;
    }

    fn try_resize(&mut self, target: &mut impl FrameTarget) -> Result<ResizeOutcome> {
        let outcome = target.resize()?;
        if outcome == ResizeOutcome::Resized {
            self.needs_resize = false;
        }
        Ok(outcome)
    }

    /// Run one frame. Errors are fatal; only out-of-date and minimized
    /// surfaces are reported as skipped frames.
    pub fn tick(&mut self, target: &mut impl FrameTarget) -> Result<FrameOutcome> {
        debug_assert_eq!(self.state, FrameState::Idle, "tick re-entered mid-frame");

        if self.needs_resize && self.try_resize(target)? == ResizeOutcome::Deferred {
            return Ok(FrameOutcome::Skipped(SkipReason::Minimized));
        }

        target.update_uniforms()?;

        self.state = FrameState::Acquiring;
        let image_index = match target.acquire()? {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.needs_resize = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                self.state = FrameState::Idle;
                self.needs_resize = true;
                self.try_resize(target)?;
                return Ok(FrameOutcome::Skipped(SkipReason::OutOfDate));
            }
        };

        self.state = FrameState::Recording;
        let draw_calls = target.record(image_index)?;

        target.submit(image_index)?;
        self.state = FrameState::Submitted;

        self.state = FrameState::Presenting;
        let presented = target.present(image_index)?;
        target.flush()?;
        self.state = FrameState::Idle;
        self.frames += 1;

        match presented {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => self.needs_resize = true,
            PresentOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on present, resizing");
                self.needs_resize = true;
                self.try_resize(target)?;
            }
        }

        Ok(FrameOutcome::Rendered {
            image_index,
            draw_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Uniforms,
        Acquire,
        Record(u32),
        Submit(u32),
        Present(u32),
        Flush,
        Resize,
    }

    #[derive(Default)]
    struct MockTarget {
        calls: Vec<Call>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        resizes: VecDeque<ResizeOutcome>,
        draws: u32,
    }

    impl MockTarget {
        fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| f(c)).count()
        }
    }

    impl FrameTarget for MockTarget {
        fn update_uniforms(&mut self) -> Result<()> {
            self.calls.push(Call::Uniforms);
            Ok(())
        }

        fn acquire(&mut self) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire);
            Ok(self.acquires.pop_front().unwrap_or(AcquireOutcome::Ready {
                image_index: 0,
                suboptimal: false,
            }))
        }

        fn record(&mut self, image_index: u32) -> Result<u32> {
            self.calls.push(Call::Record(image_index));
            Ok(self.draws)
        }

        fn submit(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Submit(image_index));
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn flush(&mut self) -> Result<()> {
            self.calls.push(Call::Flush);
            Ok(())
        }

        fn resize(&mut self) -> Result<ResizeOutcome> {
            self.calls.push(Call::Resize);
            Ok(self.resizes.pop_front().unwrap_or(ResizeOutcome::Resized))
        }
    }

    #[test]
    fn normal_frame_runs_in_order() {
        let mut target = MockTarget {
            draws: 3,
            acquires: VecDeque::from([AcquireOutcome::Ready {
                image_index: 2,
                suboptimal: false,
            }]),
            ..Default::default()
        };
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.tick(&mut target).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Rendered {
                image_index: 2,
                draw_calls: 3
            }
        );
        assert_eq!(
            target.calls,
            vec![
                Call::Uniforms,
                Call::Acquire,
                Call::Record(2),
                Call::Submit(2),
                Call::Present(2),
                Call::Flush,
            ]
        );
        assert_eq!(frame_loop.state(), FrameState::Idle);
        assert_eq!(frame_loop.frames_rendered(), 1);
    }

    #[test]
    fn out_of_date_acquire_records_nothing_and_resizes() {
        let mut target = MockTarget {
            draws: 5,
            acquires: VecDeque::from([AcquireOutcome::OutOfDate]),
            ..Default::default()
        };
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.tick(&mut target).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::OutOfDate));
        assert_eq!(target.count(|c| matches!(c, Call::Record(_))), 0);
        assert_eq!(target.count(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(target.count(|c| *c == Call::Resize), 1);
        assert_eq!(frame_loop.state(), FrameState::Idle);
        assert!(!frame_loop.resize_pending());
        assert_eq!(frame_loop.frames_rendered(), 0);
    }

    #[test]
    fn minimized_resize_is_retried_next_tick() {
        let mut target = MockTarget {
            acquires: VecDeque::from([AcquireOutcome::OutOfDate]),
            resizes: VecDeque::from([ResizeOutcome::Deferred, ResizeOutcome::Deferred]),
            ..Default::default()
        };
        let mut frame_loop = FrameLoop::new();

        assert_eq!(
            frame_loop.tick(&mut target).unwrap(),
            FrameOutcome::Skipped(SkipReason::OutOfDate)
        );
        assert!(frame_loop.resize_pending());

        // Still minimized: nothing is acquired
        assert_eq!(
            frame_loop.tick(&mut target).unwrap(),
            FrameOutcome::Skipped(SkipReason::Minimized)
        );
        assert_eq!(target.count(|c| *c == Call::Acquire), 1);

        // Restored: resize succeeds and the frame renders
        assert!(matches!(
            frame_loop.tick(&mut target).unwrap(),
            FrameOutcome::Rendered { .. }
        ));
        assert!(!frame_loop.resize_pending());
        assert_eq!(target.count(|c| *c == Call::Resize), 3);
    }

    #[test]
    fn suboptimal_acquire_defers_resize_to_next_frame() {
        let mut target = MockTarget {
            acquires: VecDeque::from([AcquireOutcome::Ready {
                image_index: 1,
                suboptimal: true,
            }]),
            ..Default::default()
        };
        let mut frame_loop = FrameLoop::new();

        assert!(matches!(
            frame_loop.tick(&mut target).unwrap(),
            FrameOutcome::Rendered { image_index: 1, .. }
        ));
        assert!(frame_loop.resize_pending());
        assert_eq!(target.count(|c| *c == Call::Resize), 0);

        frame_loop.tick(&mut target).unwrap();
        assert_eq!(target.calls.iter().filter(|c| **c == Call::Resize).count(), 1);
        assert!(!frame_loop.resize_pending());
    }

    #[test]
    fn out_of_date_present_flushes_then_resizes() {
        let mut target = MockTarget {
            presents: VecDeque::from([PresentOutcome::OutOfDate]),
            ..Default::default()
        };
        let mut frame_loop = FrameLoop::new();

        frame_loop.tick(&mut target).unwrap();
        let tail: Vec<Call> = target.calls[target.calls.len() - 3..].to_vec();
        assert_eq!(tail, vec![Call::Present(0), Call::Flush, Call::Resize]);
        assert!(!frame_loop.resize_pending());
    }

    #[test]
    fn every_present_is_followed_by_flush() {
        let mut target = MockTarget::default();
        let mut frame_loop = FrameLoop::new();
        for _ in 0..4 {
            frame_loop.tick(&mut target).unwrap();
        }
        let presents = target.count(|c| matches!(c, Call::Present(_)));
        assert_eq!(presents, 4);
        for (i, call) in target.calls.iter().enumerate() {
            if matches!(call, Call::Present(_)) {
                assert_eq!(target.calls[i + 1], Call::Flush);
            }
        }
    }

    #[test]
    fn requested_resize_runs_before_acquire() {
        let mut target = MockTarget::default();
        let mut frame_loop = FrameLoop::new();
        frame_loop.request_resize();
        frame_loop.tick(&mut target).unwrap();
        assert_eq!(target.calls[0], Call::Resize);
        assert_eq!(target.calls[1], Call::Uniforms);
    }
}
