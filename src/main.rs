use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use task_pipe::{Samples, Stealer, Worker, mono_time_ns, pipe};

#[cfg(not(unix))]
compile_error!("The driver binary only supports Unix-like operating systems.");

const CAPACITY: usize = 512;

#[derive(Parser, Debug)]
#[command(version, about = "Exercises the SPMC work pipe end to end", long_about = None)]
struct Args {
    /// Operation mode, selected via subcommand.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pushes sequential IDs through the pipe and verifies that every one
    /// is delivered exactly once.
    Validate {
        /// Number of stealer threads.
        #[arg(short = 'c', long = "consumers", default_value_t = 4)]
        consumers: usize,

        /// Number of IDs to push.
        #[arg(short = 'n', long = "items", default_value_t = 65_535)]
        items: u32,
    },

    /// Interleaves writer front pops with a single stealer and checks that
    /// the two sides together deliver every ID exactly once.
    Interleave {
        /// Number of IDs to push.
        #[arg(short = 'n', long = "items", default_value_t = 100)]
        items: u32,

        /// Front-pop after every PERIOD-th push.
        #[arg(short = 'p', long = "period", default_value_t = 3)]
        period: u32,
    },

    /// Measures push-to-steal latency percentiles under load.
    Bench {
        /// Number of stealer threads.
        #[arg(short = 'c', long = "consumers", default_value_t = 4)]
        consumers: usize,

        /// Number of timestamped items to push.
        #[arg(short = 't', long = "trials", default_value_t = 100_000)]
        trials: usize,

        /// Minimum period between pushes in nanoseconds; 0 disables throttling.
        #[arg(short = 'p', long = "period", default_value_t = 0)]
        period: u64,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Validate { consumers, items } => validate(consumers, items),
        Commands::Interleave { items, period } => interleave(items, period),
        Commands::Bench {
            consumers,
            trials,
            period,
        } => bench(consumers, trials, period),
    }
}

/// Pushes until the pipe accepts the value, spinning on a full ring.
#[inline(always)]
fn push_spinning(worker: &Worker<u32, CAPACITY>, id: u32) {
    let mut value = id;
    while let Err(back) = worker.push(value) {
        value = back;
        std::hint::spin_loop();
    }
}

fn validate(consumers: usize, items: u32) -> ExitCode {
    println!("validate: {items} items, {consumers} consumers, capacity {CAPACITY}");

    let (worker, stealer) = pipe::<u32, CAPACITY>();
    let tally: Arc<Vec<AtomicU32>> = Arc::new((0..items).map(|_| AtomicU32::new(0)).collect());
    let done = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..consumers)
        .map(|_| {
            let stealer = stealer.clone();
            let tally = Arc::clone(&tally);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut received = 0u32;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    match stealer.steal() {
                        Some(id) => {
                            tally[id as usize].fetch_add(1, Ordering::Relaxed);
                            received += 1;
                        }
                        None if finished => break received,
                        None => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    for id in 0..items {
        push_spinning(&worker, id);
    }
    done.store(true, Ordering::Release);

    for (index, handle) in handles.into_iter().enumerate() {
        let received = handle.join().unwrap();
        println!("consumer {index}: {received} items");
    }

    let missing = tally
        .iter()
        .enumerate()
        .filter(|(_, count)| count.load(Ordering::Relaxed) != 1)
        .inspect(|(id, count)| {
            println!("id {id}: delivered {} times", count.load(Ordering::Relaxed));
        })
        .count();

    if missing == 0 {
        println!("ok: every id delivered exactly once");
        ExitCode::SUCCESS
    } else {
        println!("FAILED: {missing} ids not delivered exactly once");
        ExitCode::FAILURE
    }
}

fn interleave(items: u32, period: u32) -> ExitCode {
    assert!(period > 0, "period must be at least 1");
    println!("interleave: {items} items, front pop every {period} pushes");

    let (worker, stealer) = pipe::<u32, 16>();
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let stealer = stealer.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut stolen = Vec::new();
            loop {
                let finished = done.load(Ordering::Acquire);
                match stealer.steal() {
                    Some(id) => stolen.push(id),
                    None if finished => break stolen,
                    None => thread::yield_now(),
                }
            }
        })
    };

    let mut popped = Vec::new();
    for id in 0..items {
        let mut value = id;
        while let Err(back) = worker.push(value) {
            value = back;
            thread::yield_now();
        }
        if id % period == period - 1 {
            if let Some(taken) = worker.pop() {
                popped.push(taken);
            }
        }
    }
    done.store(true, Ordering::Release);

    let stolen = consumer.join().unwrap();
    println!("popped from head: {}, stolen from tail: {}", popped.len(), stolen.len());

    let mut delivered = stolen;
    delivered.extend_from_slice(&popped);
    delivered.sort_unstable();
    let expected: Vec<u32> = (0..items).collect();

    if delivered == expected {
        println!("ok: front and back together delivered each id exactly once");
        ExitCode::SUCCESS
    } else {
        println!("FAILED: delivered multiset does not match");
        ExitCode::FAILURE
    }
}

fn bench(consumers: usize, trials: usize, period: u64) -> ExitCode {
    println!("bench: {trials} trials, {consumers} consumers, period {period} ns");

    // One core for the worker, one per stealer, when the machine has them.
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    if cores.len() < consumers + 1 {
        println!("note: {} cores available, running unpinned", cores.len());
    }

    let (worker, stealer) = pipe::<u64, CAPACITY>();
    let done = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..consumers)
        .map(|index| {
            let stealer: Stealer<u64, CAPACITY> = stealer.clone();
            let done = Arc::clone(&done);
            let core = cores.get(index + 1).copied();
            thread::spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                let mut samples = Samples::with_capacity(trials);
                loop {
                    let finished = done.load(Ordering::Acquire);
                    match stealer.steal() {
                        Some(sent_at) => samples.record(mono_time_ns() - sent_at),
                        None if finished => break samples,
                        None => std::hint::spin_loop(),
                    }
                }
            })
        })
        .collect();

    if let Some(core) = cores.first() {
        core_affinity::set_for_current(*core);
    }
    for _ in 0..trials {
        let deadline = mono_time_ns() + period;
        let mut value = mono_time_ns();
        while let Err(back) = worker.push(value) {
            value = back;
            std::hint::spin_loop();
        }
        while mono_time_ns() < deadline {}
    }
    done.store(true, Ordering::Release);

    for (index, handle) in handles.into_iter().enumerate() {
        let mut samples = handle.join().unwrap();
        if samples.is_empty() {
            println!("consumer {index}: no samples");
        } else {
            samples.sort();
            println!("{}", samples.summary(&format!("consumer {index}")));
        }
    }

    ExitCode::SUCCESS
}
