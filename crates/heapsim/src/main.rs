//! Drives a [`heap::Heap`] through a fill, fragment, coalesce and churn
//! workload and prints the resulting statistics.

use std::{process, ptr::NonNull, slice, thread};

use argh::FromArgs;
use heap::{
    BYTE_ALIGNMENT, GlobalHeap, Heap, HeapBuffer, HeapConfig, LogHooks, Report, SpinSection,
    TOTAL_HEAP_SIZE,
};
use log::LevelFilter;
use snafu::{ResultExt as _, ensure_whatever, whatever};

use self::error::GenericError;

mod error;
mod logger;

type SimHeap = Heap<'static, SpinSection, LogHooks>;

static BUFFER: HeapBuffer<TOTAL_HEAP_SIZE> = HeapBuffer::new();
static HEAP: GlobalHeap<SpinSection, LogHooks> = GlobalHeap::new();

/// Exercise the coalescing heap and print its statistics.
#[derive(Debug, FromArgs)]
struct Args {
    /// size of the heap buffer in bytes
    #[argh(option, default = "TOTAL_HEAP_SIZE")]
    heap_size: usize,
    /// payload size used by the fill phase
    #[argh(option, default = "100")]
    request_size: usize,
    /// block alignment in bytes
    #[argh(option, default = "BYTE_ALIGNMENT")]
    alignment: usize,
    /// number of concurrent tasks in the churn phase
    #[argh(option, default = "4")]
    tasks: usize,
    /// operations per task in the churn phase
    #[argh(option, default = "1000")]
    rounds: usize,
    /// zero blocks when they are freed
    #[argh(switch)]
    clear_on_free: bool,
    /// log every allocation and free
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        log::error!("failed at {}", err.location());
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    let level = if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    logger::init(level).whatever_context("failed to install logger")?;

    let config = HeapConfig::new()
        .with_alignment(args.alignment)
        .with_clear_memory_on_free(args.clear_on_free)
        .with_malloc_failed_hook(true);
    let heap = HEAP
        .init(heap_buffer(args.heap_size), SpinSection::new(), LogHooks, config)
        .whatever_context("failed to initialize heap")?;
    let initial = heap.remaining_free_size();
    log::info!("heap ready: {initial} bytes free");

    fill_and_fragment(heap, args.request_size)?;
    churn(heap, args)?;

    let stats = heap.stats();
    println!("{stats}");
    ensure_whatever!(
        stats.available_bytes == initial,
        "heap lost {} bytes",
        initial.abs_diff(stats.available_bytes)
    );
    ensure_whatever!(
        stats.free_block_count == 1,
        "free space did not coalesce, {} free blocks left",
        stats.free_block_count
    );
    Ok(())
}

fn heap_buffer(size: usize) -> &'static mut [u8] {
    match BUFFER.take() {
        Some(buffer) if size <= buffer.len() => &mut buffer[..size],
        _ => vec![0; size].leak(),
    }
}

fn fill_and_fragment(heap: &SimHeap, request_size: usize) -> Result<(), GenericError> {
    let mut blocks = Vec::new();
    while let Some(ptr) = heap.malloc(request_size) {
        blocks.push(ptr);
    }
    ensure_whatever!(
        !blocks.is_empty(),
        "heap cannot hold a single {request_size}-byte block"
    );
    log::info!("fill: {} blocks of {request_size} bytes", blocks.len());

    let mut kept = Vec::new();
    for (i, ptr) in blocks.into_iter().enumerate() {
        if i % 2 == 0 {
            unsafe { heap.free(ptr.as_ptr()) };
        } else {
            kept.push(ptr);
        }
    }

    let stats = heap.stats();
    log::info!(
        "fragment: {} bytes free in {} blocks, largest {} bytes",
        stats.available_bytes,
        stats.free_block_count,
        stats.largest_free_block_bytes
    );
    // a payload of the largest block size cannot fit once the header is added
    if let Some(ptr) = heap.malloc(stats.largest_free_block_bytes) {
        unsafe { heap.free(ptr.as_ptr()) };
        whatever!(
            "{}-byte request fit into a fragmented heap",
            stats.largest_free_block_bytes
        );
    }

    for ptr in kept {
        unsafe { heap.free(ptr.as_ptr()) };
    }
    let stats = heap.stats();
    log::info!(
        "coalesce: {} bytes free in {} blocks",
        stats.available_bytes,
        stats.free_block_count
    );
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskReport {
    allocations: usize,
    failures: usize,
    corrupted: usize,
}

fn churn(heap: &'static SimHeap, args: &Args) -> Result<(), GenericError> {
    let rounds = args.rounds;
    let max_size = args.request_size.max(1);

    let mut total = TaskReport::default();
    thread::scope(|s| -> Result<(), GenericError> {
        let mut handles = Vec::new();
        for task in 0..args.tasks {
            let handle = thread::Builder::new()
                .name(format!("task{task}"))
                .spawn_scoped(s, move || run_task(heap, task, rounds, max_size))
                .whatever_context("failed to spawn task")?;
            handles.push(handle);
        }
        for handle in handles {
            let Ok(report) = handle.join() else {
                whatever!("task panicked");
            };
            total.allocations += report.allocations;
            total.failures += report.failures;
            total.corrupted += report.corrupted;
        }
        Ok(())
    })?;

    log::info!(
        "churn: {} allocations, {} failed, over {} tasks",
        total.allocations,
        total.failures,
        args.tasks
    );
    ensure_whatever!(
        total.corrupted == 0,
        "{} blocks were overwritten by another task",
        total.corrupted
    );
    Ok(())
}

fn run_task(heap: &SimHeap, task: usize, rounds: usize, max_size: usize) -> TaskReport {
    const MAX_LIVE: usize = 8;

    let mut report = TaskReport::default();
    let mut live = Vec::<(NonNull<u8>, usize, u8)>::new();
    let tag = u8::try_from(task % 251).unwrap_or_default() + 1;

    for round in 0..rounds {
        // tasks walk the size range with different strides so their requests interleave
        let step = round.wrapping_mul(7).wrapping_add(task.wrapping_mul(13));
        if live.len() < MAX_LIVE && (live.is_empty() || step % 4 != 0) {
            let size = 1 + step % max_size;
            match heap.malloc(size) {
                Some(ptr) => {
                    unsafe { ptr.as_ptr().write_bytes(tag, size) };
                    live.push((ptr, size, tag));
                    report.allocations += 1;
                }
                None => report.failures += 1,
            }
        } else {
            let (ptr, size, tag) = live.swap_remove(step % live.len());
            report.corrupted += usize::from(!release(heap, ptr, size, tag));
        }
    }
    for (ptr, size, tag) in live {
        report.corrupted += usize::from(!release(heap, ptr, size, tag));
    }
    report
}

/// Frees a block after checking that it still holds `tag`.
fn release(heap: &SimHeap, ptr: NonNull<u8>, size: usize, tag: u8) -> bool {
    let intact = unsafe { slice::from_raw_parts(ptr.as_ptr(), size) }
        .iter()
        .all(|&b| b == tag);
    unsafe { heap.free(ptr.as_ptr()) };
    intact
}
