use anyhow::Result;
use indicatif::MultiProgress;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tapmeter::backends::ring::RingEngine;
use tapmeter::prelude::*;
use util::Voice;

mod util;

const TRACKS: [(&str, usize, f32); 3] = [("drums", 1, 110.), ("bass", 1, 55.), ("pad", 2, 330.)];
/// The pad track is muted and unmuted at this period, to show tracks coming and going.
const PAD_TOGGLE: Duration = Duration::from_secs(4);

fn main() -> Result<()> {
    env_logger::init();

    let engine = RingEngine::default();
    let frame_loop = FrameLoop::new();
    let quit = util::quit_on_enter();
    let bars = MultiProgress::new();

    let mut all_sources = HashMap::new();
    let mut audio_threads = Vec::new();
    let mut track_bars = Vec::new();
    for (i, (name, channels, frequency)) in TRACKS.into_iter().enumerate() {
        let (source, feed) = engine.create_path(channels);
        let voices = vec![
            Voice::new(frequency, 0.25 * (i + 1) as f32, 0.7),
            Voice::new(frequency * 1.5, 0.2, 0.5),
        ];
        audio_threads.push(util::spawn_audio_thread(feed, voices, quit.clone()));
        all_sources.insert(name, source);
        track_bars.push((name, util::level_bar(&bars, name)?));
    }

    let mut meter = MultiMeter::new(engine, frame_loop.clone(), MultiMeterConfig::default());
    let start = Instant::now();
    while !quit.load(Ordering::Relaxed) {
        let now = start.elapsed();
        let pad_muted = (now.as_millis() / PAD_TOGGLE.as_millis()) % 2 == 1;
        let live: HashMap<_, _> = all_sources
            .iter()
            .filter(|(name, _)| !(pad_muted && **name == "pad"))
            .map(|(name, source)| (*name, source.clone()))
            .collect();

        let report = meter.reconcile(&live);
        if !report.is_empty() {
            log::info!(attached:? = report.attached, detached:? = report.detached;
                "Tracks changed");
        }
        frame_loop.run_frame(now);
        for (name, bar) in &track_bars {
            util::show_levels(bar, &meter.levels(name));
        }
        thread::sleep(util::FRAME_DURATION);
    }

    meter.teardown();
    for audio in audio_threads {
        audio
            .join()
            .map_err(|_| anyhow::anyhow!("Audio thread panicked"))?;
    }
    Ok(())
}
