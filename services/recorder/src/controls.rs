//! Interactive debug surface: playback controls read from stdin and a
//! per-frame overlay.
//!
//! Keys (one per line): `p` toggles playback, `a` toggles pause-on-trigger,
//! `f` toggles fast-forward.

use crate::pipeline::AnalysisReport;
use crate::recording::Transition;
use crate::region::RegionSet;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use tracing::{debug, info};

const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    TogglePlayback,
    TogglePauseOnTrigger,
    ToggleFastForward,
}

impl ControlEvent {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "p" => Some(Self::TogglePlayback),
            "a" => Some(Self::TogglePauseOnTrigger),
            "f" => Some(Self::ToggleFastForward),
            _ => None,
        }
    }
}

/// Read control keys from stdin on a dedicated thread.
pub fn spawn_stdin_reader() -> io::Result<Receiver<ControlEvent>> {
    let (tx, rx) = mpsc::channel();

    std::thread::Builder::new()
        .name("debug-controls".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match ControlEvent::parse(&line) {
                    Some(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => debug!(input = %line.trim(), "Unknown control key"),
                }
            }
        })?;

    Ok(rx)
}

/// Playback state owned by the capture stage.
#[derive(Debug)]
pub struct DebugControls {
    events: Option<Receiver<ControlEvent>>,
    paused: bool,
    pause_on_trigger: bool,
    fast_forward: bool,
}

impl DebugControls {
    pub fn new(events: Receiver<ControlEvent>, pause_on_trigger: bool) -> Self {
        Self {
            events: Some(events),
            paused: false,
            pause_on_trigger,
            fast_forward: false,
        }
    }

    /// Non-interactive: never pauses, never renders.
    pub fn disabled() -> Self {
        Self {
            events: None,
            paused: false,
            pause_on_trigger: false,
            fast_forward: false,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.events.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_on_trigger(&self) -> bool {
        self.pause_on_trigger
    }

    pub fn fast_forward(&self) -> bool {
        self.fast_forward
    }

    pub fn apply(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::TogglePlayback => self.paused = !self.paused,
            ControlEvent::TogglePauseOnTrigger => {
                self.pause_on_trigger = !self.pause_on_trigger;
                self.fast_forward = false;
            }
            ControlEvent::ToggleFastForward => {
                self.fast_forward = !self.fast_forward;
                self.pause_on_trigger = true;
            }
        }

        info!(
            paused = self.paused,
            pause_on_trigger = self.pause_on_trigger,
            fast_forward = self.fast_forward,
            "Playback controls changed"
        );
    }

    /// Apply all queued events without blocking.
    pub fn poll(&mut self) {
        loop {
            let event = match &self.events {
                Some(events) => events.try_recv(),
                None => return,
            };

            match event {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.events = None;
                    return;
                }
            }
        }
    }

    /// React to the analysis of a sampled frame.
    pub fn on_report(&mut self, report: &AnalysisReport) {
        if self.is_interactive()
            && self.pause_on_trigger
            && matches!(report.transition, Transition::Started { .. })
        {
            info!("Recording triggered, playback paused");
            self.paused = true;
        }
    }

    /// Whether the overlay should be drawn for the current frame.
    pub fn overlay_enabled(&self, recording: bool) -> bool {
        self.is_interactive() && (recording || !self.fast_forward)
    }

    /// Block while playback is paused, until resumed or `running` is cleared.
    pub fn wait_while_paused(&mut self, running: &AtomicBool) {
        self.poll();

        while self.paused && running.load(Ordering::SeqCst) {
            let event = match &self.events {
                Some(events) => events.recv_timeout(PAUSE_POLL),
                None => Err(RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(event) => self.apply(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.events = None;
                    self.paused = false;
                }
            }
        }
    }
}

/// Visualisation of one analysed frame.
pub trait Overlay: Send {
    fn render(&mut self, report: &AnalysisReport);
}

/// Logs per-region verdicts instead of drawing them.
#[derive(Debug, Clone)]
pub struct LogOverlay {
    names: Vec<String>,
}

impl LogOverlay {
    pub fn new(regions: &RegionSet) -> Self {
        Self {
            names: regions.iter().map(|region| region.name.clone()).collect(),
        }
    }
}

impl Overlay for LogOverlay {
    fn render(&mut self, report: &AnalysisReport) {
        let Some(analysis) = &report.analysis else {
            return;
        };

        for verdict in analysis.verdicts.iter().filter(|v| v.applicable) {
            let name = self
                .names
                .get(verdict.index)
                .map(String::as_str)
                .unwrap_or("?");
            debug!(
                region = name,
                active = verdict.active,
                diff_sum = verdict.activity.diff_sum,
                changed_fraction = verdict.activity.changed_fraction(),
                stream_time = report.timestamp,
                "Overlay"
            );
        }

        debug!(
            weather_noise = analysis.weather_noise,
            sky_light = analysis.sky_light,
            is_night = analysis.is_night,
            recording = report.recording,
            "Overlay"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(transition: Transition) -> AnalysisReport {
        AnalysisReport {
            timestamp: 1.0,
            analysis: None,
            transition,
            recording: matches!(transition, Transition::Started { .. }),
        }
    }

    #[test]
    fn test_parse_keys() {
        assert_eq!(ControlEvent::parse("p\n"), Some(ControlEvent::TogglePlayback));
        assert_eq!(ControlEvent::parse(" a "), Some(ControlEvent::TogglePauseOnTrigger));
        assert_eq!(ControlEvent::parse("f"), Some(ControlEvent::ToggleFastForward));
        assert_eq!(ControlEvent::parse("x"), None);
    }

    #[test]
    fn test_fast_forward_forces_pause_on_trigger() {
        let (_tx, rx) = mpsc::channel();
        let mut controls = DebugControls::new(rx, false);

        controls.apply(ControlEvent::ToggleFastForward);
        assert!(controls.fast_forward());
        assert!(controls.pause_on_trigger());

        controls.apply(ControlEvent::TogglePauseOnTrigger);
        assert!(!controls.fast_forward());
        assert!(!controls.pause_on_trigger());
    }

    #[test]
    fn test_trigger_pauses_when_enabled() {
        let (_tx, rx) = mpsc::channel();
        let mut controls = DebugControls::new(rx, true);

        controls.on_report(&report(Transition::Unchanged));
        assert!(!controls.is_paused());

        controls.on_report(&report(Transition::Started { lead_in: true }));
        assert!(controls.is_paused());
    }

    #[test]
    fn test_disabled_controls_never_pause() {
        let mut controls = DebugControls::disabled();
        controls.on_report(&report(Transition::Started { lead_in: false }));
        assert!(!controls.is_paused());
        assert!(!controls.overlay_enabled(true));
    }

    #[test]
    fn test_fast_forward_skips_overlay_while_idle() {
        let (_tx, rx) = mpsc::channel();
        let mut controls = DebugControls::new(rx, false);
        assert!(controls.overlay_enabled(false));

        controls.apply(ControlEvent::ToggleFastForward);
        assert!(!controls.overlay_enabled(false));
        assert!(controls.overlay_enabled(true));
    }

    #[test]
    fn test_paused_playback_resumes_on_key() {
        let (tx, rx) = mpsc::channel();
        let mut controls = DebugControls::new(rx, false);
        let running = AtomicBool::new(true);

        tx.send(ControlEvent::TogglePlayback).unwrap();
        controls.poll();
        assert!(controls.is_paused());

        tx.send(ControlEvent::TogglePlayback).unwrap();
        controls.wait_while_paused(&running);
        assert!(!controls.is_paused());
    }

    #[test]
    fn test_pause_released_when_input_closes() {
        let (tx, rx) = mpsc::channel();
        let mut controls = DebugControls::new(rx, false);
        let running = AtomicBool::new(true);

        controls.apply(ControlEvent::TogglePlayback);
        drop(tx);
        controls.wait_while_paused(&running);
        assert!(!controls.is_paused());
        assert!(!controls.is_interactive());
    }
}
