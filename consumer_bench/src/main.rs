use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use consumer::{Consumer, ConsumerConfig, ConsumerError, ErrorLevel, Failure, Fed, FifoBuffer, LogConfig, Sleeper};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "consumer-bench.toml")]
    config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BenchSettings {
    producers: usize,
    messages: u64,
    /// Bounded buffer capacity; unbounded when unset.
    capacity: Option<usize>,
    /// Every n-th message fails with a warning. 0 disables.
    warn_every: u64,
    /// Pause between feeds of one producer.
    pace_micros: u64,
}

impl Default for BenchSettings {
    fn default() -> Self {
        BenchSettings {
            producers: 4,
            messages: 1_000_000,
            capacity: None,
            warn_every: 0,
            pace_micros: 0,
        }
    }
}

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    consumer: ConsumerConfig,
    log: LogConfig,
    bench: BenchSettings,
}

#[derive(Default, Debug, Clone, Copy)]
struct Tally {
    queued: u64,
    rejected: u64,
    skipped: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    consumer::init_logging(&cfg.log)?;

    let closing = Arc::new(AtomicBool::new(false));
    let pacer = Arc::new(Sleeper::new());
    watch_signals(Arc::clone(&closing), Arc::clone(&pacer))?;
    run(&cfg, &closing, &pacer)
}

fn watch_signals(closing: Arc<AtomicBool>, pacer: Arc<Sleeper>) -> Result<(), Box<dyn Error>> {
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                warn!(signal, "signal received, closing producers");
                closing.store(true, Ordering::SeqCst);
                pacer.wake_up();
            }
        })?;
    Ok(())
}

fn run(cfg: &BenchConfig, closing: &Arc<AtomicBool>, pacer: &Arc<Sleeper>) -> Result<(), Box<dyn Error>> {
    let settings = &cfg.bench;
    let buffer: FifoBuffer<u64> = match settings.capacity {
        Some(capacity) => FifoBuffer::bounded(capacity),
        None => FifoBuffer::new(),
    };

    let processed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&processed);
    let warn_every = settings.warn_every;
    let consumer = Arc::new(Consumer::new(
        cfg.consumer.clone(),
        buffer,
        move |message: u64| -> Result<(), Failure> {
            if warn_every > 0 && message > 0 && message % warn_every == 0 {
                return Err(Failure::msg(
                    ErrorLevel::Warning,
                    format!("message {} flagged", message),
                ));
            }
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        },
    )?);
    consumer.init();
    consumer.start()?;

    let producers = settings.producers.max(1);
    let per_producer = settings.messages / producers as u64;
    let pace = Duration::from_micros(settings.pace_micros);
    info!(producers, per_producer, "feeding consumer");

    let start = Instant::now();
    let handles = (0..producers)
        .map(|p| {
            let consumer = Arc::clone(&consumer);
            let closing = Arc::clone(closing);
            let pacer = Arc::clone(pacer);
            thread::Builder::new()
                .name(format!("producer-{}", p))
                .spawn(move || -> Result<Tally, ConsumerError> {
                    let mut tally = Tally::default();
                    for n in 0..per_producer {
                        if closing.load(Ordering::SeqCst) {
                            break;
                        }
                        match consumer.feed(p as u64 * per_producer + n)? {
                            Fed::Queued => tally.queued += 1,
                            Fed::Rejected => tally.rejected += 1,
                            Fed::Skipped => tally.skipped += 1,
                        }
                        if p == 0 && n % 100_000 == 0 {
                            eprint!("\rTotal {} ops (producer 0)", n);
                        }
                        if !pace.is_zero() {
                            pacer.sleep_for(pace);
                        }
                    }
                    Ok(tally)
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut total = Tally::default();
    for handle in handles {
        let tally = handle.join().map_err(|_| "producer thread panicked")??;
        total.queued += tally.queued;
        total.rejected += tally.rejected;
        total.skipped += tally.skipped;
    }
    // drains whatever the producers left in the buffer
    consumer.close()?;

    let duration = start.elapsed();
    let done = processed.load(Ordering::Relaxed);
    let iops = ((done as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages consumed/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    println!(
        "queued: {}, rejected: {}, skipped: {}, processed: {}",
        total.queued, total.rejected, total.skipped, done
    );
    Ok(())
}
