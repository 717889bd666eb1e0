//! Overlay painting and the frame loop
//!
//! Each frame re-acquires the overlay window, fills the centre rectangle and
//! releases the overlay again. The loop runs until the shutdown channel fires.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use x11rb::protocol::xproto::Window;

use crate::canvas::Canvas;
use crate::geometry::{Rect, Rgb, centered_half};
use crate::stats::FrameStats;
use crate::x11_async::EventSource;

/// Access to the shared compositing overlay surface
pub trait OverlaySession {
    /// Take a reference on the overlay window and return its id
    fn acquire_overlay(&self) -> Result<Window>;

    /// Drop the reference taken by `acquire_overlay`
    fn release_overlay(&self) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// Fill the centre half of a `width` x `height` surface with opaque red
pub fn paint<C: Canvas + ?Sized>(
    canvas: &C,
    target: Window,
    width: u16,
    height: u16,
) -> Result<Rect> {
    let rect = centered_half(width, height);
    canvas.fill_rect(target, rect, Rgb::RED)?;
    Ok(rect)
}

/// One acquire / paint / release cycle
///
/// The overlay is released even if painting fails.
pub fn paint_frame<S, C>(session: &S, canvas: &C, width: u16, height: u16) -> Result<Rect>
where
    S: OverlaySession + ?Sized,
    C: Canvas + ?Sized,
{
    let overlay = session
        .acquire_overlay()
        .context("Failed to acquire overlay window")?;

    let painted = paint(canvas, overlay, width, height);
    let released = session.release_overlay();

    let rect = painted.context("Failed to paint overlay")?;
    released.context("Failed to release overlay window")?;
    session.flush()?;

    Ok(rect)
}

/// Drives `paint_frame` until shutdown
pub struct FrameLoop<'a, S: ?Sized, C: ?Sized> {
    session: &'a S,
    canvas: &'a C,
    width: u16,
    height: u16,
    stats: FrameStats,
}

impl<'a, S, C> FrameLoop<'a, S, C>
where
    S: OverlaySession + ?Sized,
    C: Canvas + ?Sized,
{
    pub fn new(
        session: &'a S,
        canvas: &'a C,
        (width, height): (u16, u16),
        stats_interval: Duration,
    ) -> Self {
        Self {
            session,
            canvas,
            width,
            height,
            stats: FrameStats::new(stats_interval),
        }
    }

    /// Frames painted so far
    pub fn frames(&self) -> u64 {
        self.stats.total_frames()
    }

    fn frame(&mut self) -> Result<()> {
        let started = Instant::now();
        let rect = paint_frame(self.session, self.canvas, self.width, self.height)?;
        trace!("Painted {:?}", rect);

        if let Some(report) = self.stats.tick(started.elapsed()) {
            debug!(
                "Overlay: {:.1} FPS, frame avg {:?} max {:?} ({} frames total)",
                report.fps,
                report.avg_frame_time,
                report.max_frame_time,
                self.stats.total_frames()
            );
        }
        Ok(())
    }

    fn log_stop(&self, mode: &str) {
        match self.stats.last_report() {
            Some(report) => info!(
                "{} loop stopping after {} frames (last {:.1} FPS)",
                mode,
                self.frames(),
                report.fps
            ),
            None => info!("{} loop stopping after {} frames", mode, self.frames()),
        }
    }

    /// Repaint every `interval` until `shutdown` fires
    ///
    /// Queued events are consumed without repainting; protocol errors end the loop.
    pub async fn run_polling<E: EventSource>(
        &mut self,
        events: &E,
        interval: Duration,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("Starting poll loop ({:?} between frames)", interval);

        loop {
            let drained = events.drain()?;
            if drained.events > 0 {
                trace!("Skipped {} queued events", drained.events);
            }

            self.frame()?;

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.log_stop("Poll");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Repaint once, then again whenever exposure or structure events arrive
    pub async fn run_event_driven<E: EventSource>(
        &mut self,
        events: &E,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("Starting event-driven loop");
        self.frame()?;

        loop {
            if events.drain()?.damaged {
                self.frame()?;
                // Replies read during the frame may have queued more events
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.log_stop("Event");
                    return Ok(());
                }
                () = events.wait_readable() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x11_async::OverlayEvent;
    use anyhow::bail;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    const OVERLAY: Window = 0x2a;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Op {
        Acquire,
        Fill(Window, Rect, Rgb),
        Release,
        Flush,
    }

    #[derive(Default)]
    struct Recorder {
        ops: RefCell<Vec<Op>>,
        fail_fill: Cell<bool>,
        /// Accept fills but queue a server error for each, like a bad drawable
        reject_fill: Cell<bool>,
        errors: RefCell<VecDeque<OverlayEvent>>,
    }

    impl Recorder {
        fn ops(&self) -> Vec<Op> {
            self.ops.borrow().clone()
        }

        fn count(&self, op: Op) -> usize {
            self.ops.borrow().iter().filter(|o| **o == op).count()
        }
    }

    impl OverlaySession for Recorder {
        fn acquire_overlay(&self) -> Result<Window> {
            self.ops.borrow_mut().push(Op::Acquire);
            Ok(OVERLAY)
        }

        fn release_overlay(&self) -> Result<()> {
            self.ops.borrow_mut().push(Op::Release);
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            self.ops.borrow_mut().push(Op::Flush);
            Ok(())
        }
    }

    impl Canvas for Recorder {
        fn fill_rect(&self, target: Window, rect: Rect, color: Rgb) -> Result<()> {
            if self.fail_fill.get() {
                bail!("drawable went away");
            }
            self.ops.borrow_mut().push(Op::Fill(target, rect, color));
            if self.reject_fill.get() {
                self.errors
                    .borrow_mut()
                    .push_back(OverlayEvent::ProtocolError("BadDrawable".into()));
            }
            Ok(())
        }
    }

    impl EventSource for Recorder {
        fn next_event(&self) -> Result<Option<OverlayEvent>> {
            Ok(self.errors.borrow_mut().pop_front())
        }

        async fn wait_readable(&self) {
            std::future::pending::<()>().await
        }
    }

    /// Events arrive in batches; `wait_readable` releases the next batch
    #[derive(Default)]
    struct Script {
        queued: RefCell<VecDeque<OverlayEvent>>,
        batches: RefCell<VecDeque<Vec<OverlayEvent>>>,
        waits: Cell<usize>,
    }

    impl Script {
        fn new(first: Vec<OverlayEvent>, later: Vec<Vec<OverlayEvent>>) -> Self {
            Self {
                queued: RefCell::new(first.into()),
                batches: RefCell::new(later.into()),
                waits: Cell::new(0),
            }
        }
    }

    impl EventSource for Script {
        fn next_event(&self) -> Result<Option<OverlayEvent>> {
            Ok(self.queued.borrow_mut().pop_front())
        }

        async fn wait_readable(&self) {
            self.waits.set(self.waits.get() + 1);
            let next = self.batches.borrow_mut().pop_front();
            match next {
                Some(batch) => self.queued.borrow_mut().extend(batch),
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn quiet() -> Script {
        Script::default()
    }

    fn shutdown_after(delay: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(()).await;
        });
        rx
    }

    #[test]
    fn test_paint_full_hd_red() {
        let rec = Recorder::default();
        let rect = paint(&rec, OVERLAY, 1920, 1080).unwrap();

        let expected = Rect {
            x: 480,
            y: 270,
            width: 960,
            height: 540,
        };
        assert_eq!(rect, expected);
        assert_eq!(rec.ops(), vec![Op::Fill(OVERLAY, expected, Rgb::RED)]);
    }

    #[test]
    fn test_paint_is_idempotent() {
        let rec = Recorder::default();
        let first = paint(&rec, OVERLAY, 800, 600).unwrap();
        let second = paint(&rec, OVERLAY, 800, 600).unwrap();

        assert_eq!(first, second);
        let ops = rec.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], ops[1]);
    }

    #[test]
    fn test_frame_acquires_then_releases() {
        let rec = Recorder::default();
        paint_frame(&rec, &rec, 800, 600).unwrap();

        let rect = Rect {
            x: 200,
            y: 150,
            width: 400,
            height: 300,
        };
        assert_eq!(
            rec.ops(),
            vec![
                Op::Acquire,
                Op::Fill(OVERLAY, rect, Rgb::RED),
                Op::Release,
                Op::Flush
            ]
        );
    }

    #[test]
    fn test_failed_paint_still_releases() {
        let rec = Recorder::default();
        rec.fail_fill.set(true);

        assert!(paint_frame(&rec, &rec, 800, 600).is_err());
        assert_eq!(rec.ops(), vec![Op::Acquire, Op::Release]);
    }

    #[tokio::test]
    async fn test_poll_loop_stops_on_shutdown() {
        let rec = Recorder::default();
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let mut frames = FrameLoop::new(&rec, &rec, (1920, 1080), Duration::from_secs(5));
        frames
            .run_polling(&quiet(), Duration::from_millis(5), &mut rx)
            .await
            .unwrap();

        assert_eq!(frames.frames(), 1);
        assert_eq!(rec.count(Op::Acquire), 1);
        assert_eq!(rec.count(Op::Release), 1);
    }

    #[tokio::test]
    async fn test_poll_loop_pairs_every_acquire() {
        let rec = Recorder::default();
        let mut rx = shutdown_after(Duration::from_millis(40));

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        frames
            .run_polling(&quiet(), Duration::from_millis(1), &mut rx)
            .await
            .unwrap();

        assert!(frames.frames() >= 2);
        let cycle: Vec<Op> = rec
            .ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Acquire | Op::Release))
            .collect();
        assert_eq!(cycle.len() as u64, frames.frames() * 2);
        for pair in cycle.chunks(2) {
            assert_eq!(pair, [Op::Acquire, Op::Release]);
        }
    }

    #[tokio::test]
    async fn test_poll_loop_surfaces_paint_errors() {
        let rec = Recorder::default();
        rec.fail_fill.set(true);
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        let result = frames
            .run_polling(&quiet(), Duration::from_millis(1), &mut rx)
            .await;

        assert!(result.is_err());
        assert_eq!(rec.count(Op::Acquire), 1);
        assert_eq!(rec.count(Op::Release), 1);
    }

    #[tokio::test]
    async fn test_poll_loop_stops_on_protocol_error() {
        let rec = Recorder::default();
        rec.reject_fill.set(true);
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        let err = frames
            .run_polling(&rec, Duration::from_millis(1), &mut rx)
            .await
            .unwrap_err();

        // The fill went out, its error surfaced before the next frame
        assert!(err.to_string().contains("BadDrawable"));
        assert_eq!(frames.frames(), 1);
        assert_eq!(rec.count(Op::Acquire), 1);
        assert_eq!(rec.count(Op::Release), 1);
    }

    #[tokio::test]
    async fn test_event_loop_paints_once_then_waits() {
        let rec = Recorder::default();
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        frames.run_event_driven(&quiet(), &mut rx).await.unwrap();

        assert_eq!(frames.frames(), 1);
        assert_eq!(rec.count(Op::Acquire), 1);
        assert_eq!(rec.count(Op::Release), 1);
    }

    #[tokio::test]
    async fn test_event_loop_repaints_on_damage() {
        let rec = Recorder::default();
        let events = Script::new(vec![OverlayEvent::Damage], vec![]);
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        frames.run_event_driven(&events, &mut rx).await.unwrap();

        assert_eq!(frames.frames(), 2);
        assert_eq!(rec.count(Op::Acquire), 2);
        assert_eq!(rec.count(Op::Release), 2);
    }

    #[tokio::test]
    async fn test_event_loop_ignores_partial_expose() {
        let rec = Recorder::default();
        // Expose with count > 0 and unrelated traffic both classify as Ignored
        let events = Script::new(vec![OverlayEvent::Ignored, OverlayEvent::Ignored], vec![]);
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        frames.run_event_driven(&events, &mut rx).await.unwrap();

        assert_eq!(frames.frames(), 1);
    }

    #[tokio::test]
    async fn test_event_loop_wakes_for_new_events() {
        let rec = Recorder::default();
        let events = Script::new(
            vec![],
            vec![vec![OverlayEvent::Ignored, OverlayEvent::Damage]],
        );
        let mut rx = shutdown_after(Duration::from_millis(30));

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        frames.run_event_driven(&events, &mut rx).await.unwrap();

        assert_eq!(frames.frames(), 2);
        // One wake delivered the batch, the second was parked until shutdown
        assert_eq!(events.waits.get(), 2);
    }

    #[tokio::test]
    async fn test_event_loop_stops_on_protocol_error() {
        let rec = Recorder::default();
        let events = Script::new(
            vec![OverlayEvent::ProtocolError("BadMatch".into())],
            vec![],
        );
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames = FrameLoop::new(&rec, &rec, (800, 600), Duration::from_secs(5));
        let err = frames.run_event_driven(&events, &mut rx).await.unwrap_err();

        assert!(err.to_string().contains("BadMatch"));
        assert_eq!(frames.frames(), 1);
        assert_eq!(rec.count(Op::Acquire), rec.count(Op::Release));
    }
}
