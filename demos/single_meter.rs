use anyhow::Result;
use indicatif::MultiProgress;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;
use tapmeter::backends::ring::RingEngine;
use tapmeter::prelude::*;
use util::Voice;

mod util;

fn main() -> Result<()> {
    env_logger::init();

    let engine = RingEngine::default();
    let frame_loop = FrameLoop::new();
    let (source, feed) = engine.create_path(2);

    let quit = util::quit_on_enter();
    let audio = util::spawn_audio_thread(
        feed,
        vec![Voice::new(440., 0.5, 0.8), Voice::new(660., 0.3, 1.0)],
        quit.clone(),
    );

    let mut meter = SingleMeter::new(engine, frame_loop.clone());
    meter.enable(source, ProbeConfig::default());

    let bars = MultiProgress::new();
    let master = util::level_bar(&bars, "master")?;
    let left = util::level_bar(&bars, "L")?;
    let right = util::level_bar(&bars, "R")?;

    let start = Instant::now();
    while !quit.load(Ordering::Relaxed) {
        frame_loop.run_frame(start.elapsed());
        let levels = meter.levels();
        util::show_levels(&master, &levels);
        for (bar, peak) in [(&left, levels.left_peak), (&right, levels.right_peak)] {
            let peak = peak.unwrap_or(0.);
            util::show_levels(
                bar,
                &AudioLevels {
                    peak,
                    peak_db: linear_to_db(peak),
                    ..AudioLevels::SILENT
                },
            );
        }
        thread::sleep(util::FRAME_DURATION);
    }

    meter.disable();
    audio
        .join()
        .map_err(|_| anyhow::anyhow!("Audio thread panicked"))?;
    Ok(())
}
