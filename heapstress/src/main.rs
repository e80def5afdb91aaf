use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Instant,
};

use parking_lot::Mutex;
use pageheap::{GcCreateInfo, GcRuntime, GcSettings, Heap, MarkBitSweep, Mutator, ObjectRef};

#[derive(ClapParser, Debug, Clone)]
#[command(author, version, about = "Multi-threaded allocation stress test for pageheap")]
struct Cli {
    /// Mutator threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Objects allocated per thread
    #[arg(short, long, default_value_t = 200_000)]
    objects: usize,

    /// Smallest payload in bytes
    #[arg(long, default_value_t = 8)]
    min_size: usize,

    /// Largest payload in bytes
    #[arg(long, default_value_t = 512)]
    max_size: usize,

    /// Every n-th object stays reachable until all mutators are done
    #[arg(long, default_value_t = 16)]
    survive_every: usize,

    /// Every n-th object gets a finalizer (0 disables)
    #[arg(long, default_value_t = 32)]
    finalize_every: usize,

    /// Every n-th object is a large array routed to single-object pages (0 disables)
    #[arg(long, default_value_t = 5_000)]
    large_every: usize,

    /// Allocation volume that triggers the first collection
    #[arg(long)]
    trigger_bytes: Option<usize>,

    /// Threads helping the collector sweep
    #[arg(long)]
    sweep_assistants: Option<usize>,

    /// Empty pages kept per store after a collection
    #[arg(long)]
    retained_empty_pages: Option<usize>,
}

/// Per-thread root table the marker walks.
type Roots = Arc<Mutex<Vec<Vec<ObjectRef>>>>;

struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if cli.min_size == 0 || cli.min_size > cli.max_size || cli.survive_every == 0 {
        eprintln!("invalid size range or survival ratio");
        process::exit(2);
    }

    let settings = match GcSettings::from_info(&GcCreateInfo {
        trigger_bytes: cli.trigger_bytes,
        sweep_assistants: cli.sweep_assistants,
        retained_empty_pages: cli.retained_empty_pages,
        ..Default::default()
    }) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    };
    let runtime = match GcRuntime::new(settings, Arc::new(MarkBitSweep)) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    let roots: Roots = Arc::new(Mutex::new(vec![Vec::new(); cli.threads]));
    let finalized = Arc::new(AtomicUsize::new(0));
    let marked = Arc::clone(&roots);
    let counter = Arc::clone(&finalized);
    let started = runtime.start(
        Arc::new(move |_: &Heap, epoch: i64| {
            let tables = marked.lock();
            let count: usize = tables
                .iter()
                .flatten()
                .filter(|root| root.try_mark())
                .count();
            log::debug!("epoch {epoch}: marked {count} roots");
        }),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }),
    );
    if let Err(err) = started {
        eprintln!("Error: {err}");
        process::exit(1);
    }

    let begin = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|index| {
            let runtime = Arc::clone(&runtime);
            let roots = Arc::clone(&roots);
            let cli = cli.clone();
            thread::Builder::new()
                .name(format!("mutator-{index}"))
                .spawn(move || {
                    let mut mutator = runtime.attach_mutator();
                    run_mutator(&mut mutator, &cli, index, &roots);
                })
                .expect("spawn mutator")
        })
        .collect();
    for worker in workers {
        if worker.join().is_err() {
            eprintln!("mutator thread panicked");
            process::exit(1);
        }
    }

    roots.lock().iter_mut().for_each(Vec::clear);
    let mut mutator = runtime.attach_mutator();
    let last_epoch = mutator.collect_garbage_and_finalize();
    let census = runtime.heap().page_census();
    drop(mutator);
    let elapsed = begin.elapsed();

    let stats = runtime.registry().stats();
    println!(
        "{} threads x {} objects in {elapsed:?}",
        cli.threads, cli.objects
    );
    println!(
        "{last_epoch} collections, {} pauses, total pause {:?}, max pause {:?}",
        stats.pauses(),
        stats.total_pause(),
        stats.max_pause()
    );
    if let Some(cycle) = runtime.last_cycle() {
        println!("last cycle: {cycle:?}");
    }
    println!("{} finalizers run", finalized.load(Ordering::Relaxed));
    println!("{census}");
    runtime.shutdown();
}

fn run_mutator(mutator: &mut Mutator, cli: &Cli, index: usize, roots: &Roots) {
    let mut rng = Xorshift(0x9E37_79B9_7F4A_7C15 ^ (index as u64 + 1));
    let span = (cli.max_size - cli.min_size + 1) as u64;
    for i in 1..=cli.objects {
        let object = if cli.large_every != 0 && i % cli.large_every == 0 {
            mutator.create_array(8, 64 * 1024)
        } else {
            let size = cli.min_size + (rng.next() % span) as usize;
            mutator.create_object(size)
        };
        if i % cli.survive_every == 0 {
            roots.lock()[index].push(object);
        }
        if cli.finalize_every != 0 && i % cli.finalize_every == 0 {
            mutator.create_extra_object(object, true);
        }
    }
    log::info!(
        "mutator {index} done, {} roots",
        roots.lock()[index].len()
    );
}
