//! Simulator runner: drive demo workloads against a configured device
//! and print the accumulated reports.

use std::cell::Cell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use nand_core::{PageLocation, TransOp};
use nand_sim::{DeviceProfile, NandFlashSystem};

struct CliArgs {
    profile: Option<PathBuf>,
    workload: String,
    blocks: u32,
    pages: u32,
    trace_dir: Option<String>,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        profile: None,
        workload: "all".into(),
        blocks: 4,
        pages: 8,
        trace_dir: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--profile" => {
                i += 1;
                cli.profile = args.get(i).map(PathBuf::from);
            }
            "--workload" => {
                i += 1;
                if let Some(name) = args.get(i) {
                    cli.workload = name.clone();
                }
            }
            "--blocks" => {
                i += 1;
                if let Some(n) = args.get(i) {
                    cli.blocks = n.parse().unwrap_or(4);
                }
            }
            "--pages" => {
                i += 1;
                if let Some(n) = args.get(i) {
                    cli.pages = n.parse().unwrap_or(8);
                }
            }
            "--trace-dir" => {
                i += 1;
                cli.trace_dir = args.get(i).cloned();
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }
    cli
}

fn print_usage() {
    eprintln!("usage: nand-sim [options]");
    eprintln!("  --profile <path>    device profile JSON (default: built-in)");
    eprintln!("  --workload <name>   read|prog|cache|multiplane|erase|copyback|interleave|all");
    eprintln!("  --blocks <n>        blocks touched per workload (default 4)");
    eprintln!("  --pages <n>         pages touched per block (default 8)");
    eprintln!("  --trace-dir <path>  override the profile's trace directory");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = parse_args();
    let mut profile = match &cli.profile {
        Some(path) => match DeviceProfile::from_path(path) {
            Ok(profile) => profile,
            Err(err) => {
                eprintln!("{err}");
                process::exit(1);
            }
        },
        None => DeviceProfile::builtin(),
    };
    if let Some(dir) = &cli.trace_dir {
        profile.trace_dir = dir.clone();
    }

    let completions = Rc::new(Cell::new(0u64));
    let counter = completions.clone();
    let mut system = NandFlashSystem::new(
        0,
        &profile.device,
        profile.shared_params(),
        profile.env,
        profile.trace_set(),
        Some(Box::new(move |_host, _bus, _now| {
            counter.set(counter.get() + 1);
        })),
    );
    system.report_configuration();

    let blocks = cli.blocks.min(profile.device.blocks_per_plane);
    let pages = cli.pages.min(profile.device.pages_per_block);

    // the erase sweeps between program workloads keep NOP intact
    let run_all = cli.workload == "all";
    let mut ran = false;
    if run_all || cli.workload == "prog" {
        single_die_sweep(&mut system, TransOp::Prog, 0, blocks, pages);
        ran = true;
    }
    if run_all || cli.workload == "read" {
        single_die_sweep(&mut system, TransOp::Read, 0, blocks, pages);
        ran = true;
    }
    if run_all || cli.workload == "cache" {
        cache_read_sweep(&mut system, 0, blocks, pages);
        ran = true;
    }
    if run_all {
        erase_sweep(&mut system, 0, blocks);
    }
    if run_all || cli.workload == "multiplane" {
        multiplane_prog_sweep(&mut system, 0, blocks, pages);
        ran = true;
    }
    if run_all {
        erase_sweep(&mut system, 0, blocks);
    }
    if run_all || cli.workload == "interleave" {
        interleaved_sweep(&mut system, blocks, pages);
        ran = true;
    }
    if run_all {
        erase_sweep(&mut system, 0, blocks);
    }
    if run_all || cli.workload == "copyback" {
        copyback_sweep(&mut system, 0, blocks, pages);
        ran = true;
    }
    if !run_all && cli.workload == "erase" {
        erase_sweep(&mut system, 0, blocks);
        ran = true;
    }
    if !ran {
        eprintln!("unknown workload: {}", cli.workload);
        print_usage();
        process::exit(1);
    }

    println!("completions delivered             : {}", completions.get());
    println!();
    system.report_statistics();
}

fn page_addr(system: &NandFlashSystem, die: u8, block: u16, page: u8) -> u32 {
    system.device_config().linear(PageLocation {
        die,
        plane: 0,
        block,
        page,
    })
}

/// Run the device dry.
fn drain(system: &mut NandFlashSystem) {
    while system.is_active_mode() {
        if system.update_without_idle_cycles() == 0 {
            system.update(1);
        }
    }
}

fn single_die_sweep(system: &mut NandFlashSystem, op: TransOp, die: u8, blocks: u32, pages: u32) {
    println!("workload: {op:?} sweep, die {die}, {blocks} blocks x {pages} pages");
    for block in 0..blocks {
        for page in 0..pages {
            let addr = page_addr(system, die, block as u16, page as u8);
            if let Err(err) = system.add_simple(page, op, addr) {
                eprintln!("submit failed at block {block} page {page}: {err}");
                return;
            }
            drain(system);
        }
    }
}

fn cache_read_sweep(system: &mut NandFlashSystem, die: u8, blocks: u32, pages: u32) {
    println!("workload: cache-read sweep, die {die}, {blocks} blocks x {pages} pages");
    for block in 0..blocks {
        for page in 0..pages {
            let addr = page_addr(system, die, block as u16, page as u8);
            if let Err(err) = system.add_simple(page, TransOp::ReadCache, addr) {
                eprintln!("submit failed at block {block} page {page}: {err}");
                return;
            }
        }
        drain(system);
    }
}

fn multiplane_prog_sweep(system: &mut NandFlashSystem, die: u8, blocks: u32, pages: u32) {
    let planes = system.device_config().planes_per_die;
    println!("workload: multi-plane program sweep, die {die}, {blocks} blocks x {pages} pages");
    for block in 0..blocks {
        for page in 0..pages {
            let addr = page_addr(system, die, block as u16, page as u8);
            for _ in 0..planes {
                if let Err(err) = system.add_simple(page, TransOp::ProgMultiplane, addr) {
                    eprintln!("submit failed at block {block} page {page}: {err}");
                    return;
                }
            }
            drain(system);
        }
    }
}

/// Back-to-back transactions on every die; array time overlaps while the
/// bus serializes.
fn interleaved_sweep(system: &mut NandFlashSystem, blocks: u32, pages: u32) {
    let dies = system.device_config().dies_per_lu;
    println!("workload: die-interleaved program+read sweep across {dies} dies");
    for block in 0..blocks {
        for page in 0..pages {
            for die in 0..dies {
                let addr = page_addr(system, die as u8, block as u16, page as u8);
                if let Err(err) = system.add_simple(page, TransOp::Prog, addr) {
                    eprintln!("submit failed on die {die}: {err}");
                    return;
                }
            }
            drain(system);
            for die in 0..dies {
                let addr = page_addr(system, die as u8, block as u16, page as u8);
                if let Err(err) = system.add_simple(page, TransOp::Read, addr) {
                    eprintln!("submit failed on die {die}: {err}");
                    return;
                }
            }
            drain(system);
        }
    }
}

fn copyback_sweep(system: &mut NandFlashSystem, die: u8, blocks: u32, pages: u32) {
    println!("workload: copyback sweep, die {die}, {blocks} -> {blocks} blocks");
    for block in 0..blocks.saturating_sub(1) {
        for page in 0..pages {
            let src = page_addr(system, die, block as u16, page as u8);
            let dest = page_addr(system, die, (block + 1) as u16, page as u8);
            if let Err(err) = system.add_move(page, TransOp::InternalDataMovement, src, dest) {
                eprintln!("submit failed at block {block} page {page}: {err}");
                return;
            }
            drain(system);
        }
    }
}

fn erase_sweep(system: &mut NandFlashSystem, die: u8, blocks: u32) {
    println!("workload: block erase sweep, die {die}, {blocks} blocks");
    for block in 0..blocks {
        let addr = page_addr(system, die, block as u16, 0);
        if let Err(err) = system.add_simple(block, TransOp::BlockErase, addr) {
            eprintln!("submit failed at block {block}: {err}");
            return;
        }
        drain(system);
    }
}
