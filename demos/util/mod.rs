use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tapmeter::backends::ring::SignalFeed;
use tapmeter::prelude::*;

pub const SAMPLE_RATE: f32 = 48000.;
pub const BLOCK_SIZE: usize = 256;
/// Roughly 60 frames per second.
pub const FRAME_DURATION: Duration = Duration::from_millis(16);

/// Sine tone with a slow tremolo, so that meters have something to follow.
pub struct Voice {
    pub frequency: f32,
    pub tremolo: f32,
    pub amplitude: f32,
    phase: f32,
    tremolo_phase: f32,
}

impl Voice {
    pub fn new(frequency: f32, tremolo: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            tremolo,
            amplitude,
            phase: 0.,
            tremolo_phase: 0.,
        }
    }

    pub fn next_sample(&mut self) -> f32 {
        let y = (TAU * self.phase).sin();
        let envelope = 0.5 - 0.5 * (TAU * self.tremolo_phase).cos();
        self.phase = (self.phase + self.frequency / SAMPLE_RATE).fract();
        self.tremolo_phase = (self.tremolo_phase + self.tremolo / SAMPLE_RATE).fract();
        self.amplitude * envelope * y
    }
}

/// Play `voices` into `feed` at roughly real-time speed until `quit` is set. Channel `n` of the
/// feed plays voice `n` modulo the number of voices.
pub fn spawn_audio_thread(
    feed: SignalFeed,
    mut voices: Vec<Voice>,
    quit: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    assert!(!voices.is_empty());
    thread::spawn(move || {
        let channels = feed.channels();
        let mut process = feed.into_callback::<f32>();
        let mut block = vec![0f32; BLOCK_SIZE * channels];
        let block_duration = Duration::from_secs_f32(BLOCK_SIZE as f32 / SAMPLE_RATE);
        while !quit.load(Ordering::Relaxed) {
            for frame in block.chunks_exact_mut(channels) {
                for (channel, sample) in frame.iter_mut().enumerate() {
                    let voice = channel % voices.len();
                    *sample = voices[voice].next_sample();
                }
            }
            process(&block);
            thread::sleep(block_duration);
        }
    })
}

/// Flag raised once the user presses Enter.
pub fn quit_on_enter() -> Arc<AtomicBool> {
    println!("Press Enter to stop");
    let quit = Arc::new(AtomicBool::new(false));
    thread::spawn({
        let quit = quit.clone();
        move || {
            std::io::stdin().read_line(&mut String::new()).unwrap();
            quit.store(true, Ordering::Relaxed);
        }
    });
    quit
}

pub fn level_bar(bars: &MultiProgress, name: &str) -> anyhow::Result<ProgressBar> {
    let bar = bars.add(ProgressBar::new(100).with_style(
        ProgressStyle::default_bar().template("{prefix:>8} {bar:40.green} {msg}")?,
    ));
    bar.set_prefix(name.to_string());
    Ok(bar)
}

pub fn show_levels(bar: &ProgressBar, levels: &AudioLevels) {
    let pc = normalize(-60., 6., levels.peak_db).clamp(0., 1.);
    bar.set_position((100. * pc) as _);
    let clip = if levels.is_clipping { "  CLIP" } else { "" };
    bar.set_message(format!(
        "Peak: {:5.1} dB  RMS: {:5.1} dB{clip}",
        levels.peak_db, levels.rms_db
    ));
}

pub fn normalize(min: f32, max: f32, value: f32) -> f32 {
    let range = max - min;
    (value - min) / range
}
