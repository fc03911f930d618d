#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffl::{
    FflError, FileFlash, FlashDevice, FlashGeometry, FlashStats, InodeNumber, MemFlash, Volume,
    VolumeConfig, VolumeStats,
};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_SECTOR: u32 = 64 * 1024;
const DEFAULT_PAGE: u32 = 512;
const DEFAULT_BLOCKS: u32 = 64;

// ── Argument parsing ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Layout {
    blocks: u32,
    sector: u32,
    page: u32,
}

impl Layout {
    fn geometry(&self) -> Result<FlashGeometry> {
        let size = self
            .blocks
            .checked_mul(self.sector)
            .context("flash size overflows 32 bits")?;
        FlashGeometry::new(size, self.sector, self.page).with_context(|| {
            format!(
                "invalid geometry: {} blocks of {} bytes, {}-byte pages",
                self.blocks, self.sector, self.page
            )
        })
    }
}

#[derive(Debug)]
struct Options {
    layout: Layout,
    ops: u32,
    seed: u64,
    config: Option<PathBuf>,
    json: bool,
    positional: Vec<String>,
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T> {
    let Some(value) = value else {
        bail!("{flag} requires a value");
    };
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{flag}: not a number: {value}"))
}

fn parse_options(args: impl Iterator<Item = String>) -> Result<Options> {
    let mut opts = Options {
        layout: Layout {
            blocks: DEFAULT_BLOCKS,
            sector: DEFAULT_SECTOR,
            page: DEFAULT_PAGE,
        },
        ops: 2000,
        seed: 1,
        config: None,
        json: false,
        positional: Vec::new(),
    };
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--blocks" => opts.layout.blocks = parse_number(&arg, args.next())?,
            "--sector" => opts.layout.sector = parse_number(&arg, args.next())?,
            "--page" => opts.layout.page = parse_number(&arg, args.next())?,
            "--ops" => opts.ops = parse_number(&arg, args.next())?,
            "--seed" => opts.seed = parse_number(&arg, args.next())?,
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a path");
                };
                opts.config = Some(PathBuf::from(path));
            }
            "--json" => opts.json = true,
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            _ => opts.positional.push(arg),
        }
    }
    Ok(opts)
}

fn load_config(path: Option<&Path>) -> Result<VolumeConfig> {
    let Some(path) = path else {
        return Ok(VolumeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    VolumeConfig::from_json_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "format" => {
            let opts = parse_options(args)?;
            let [image] = opts.positional.as_slice() else {
                bail!("format requires exactly one <image-path>");
            };
            format_cmd(Path::new(image), &opts)
        }
        "simulate" => {
            let opts = parse_options(args)?;
            if !opts.positional.is_empty() {
                bail!("simulate takes no positional arguments");
            }
            simulate_cmd(&opts)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ffl\n");
    println!("USAGE:");
    println!("  ffl format <image-path> [--sector N] [--page N] [--blocks N] [--config FILE] [--json]");
    println!("  ffl simulate [--blocks N] [--sector N] [--page N] [--ops N] [--seed N] [--config FILE] [--json]");
}

fn print_report<T: Serialize>(report: &T, json: bool, lines: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize output")?
        );
    } else {
        lines(report);
    }
    Ok(())
}

fn print_space(stats: &VolumeStats) {
    let totals = &stats.space.totals;
    println!("free_size: {}", totals.free_size);
    println!("used_size: {}", totals.used_size);
    println!("dirty_size: {}", totals.dirty_size);
    println!("wasted_size: {}", totals.wasted_size);
    println!("erasing_size: {}", totals.erasing_size);
    println!("bad_size: {}", totals.bad_size);
    for (state, count) in &stats.space.blocks {
        println!("blocks.{state}: {count}");
    }
}

// ── format ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct FormatReport {
    image: String,
    flash_size: u32,
    sector_size: u32,
    page_size: u32,
    bad_blocks: Vec<u32>,
    volume: VolumeStats,
}

fn format_cmd(image: &Path, opts: &Options) -> Result<()> {
    let geometry = opts.layout.geometry()?;
    let config = load_config(opts.config.as_deref())?;
    let flash = Arc::new(
        FileFlash::create(image, geometry)
            .with_context(|| format!("failed to create image {}", image.display()))?,
    );
    let volume = Volume::format(Arc::clone(&flash) as Arc<dyn FlashDevice>, config)
        .with_context(|| format!("failed to format {}", image.display()))?;
    volume.sync().context("failed to sync image")?;
    tracing::info!(target: "ffl::cli", image = %image.display(), "image_formatted");

    let report = FormatReport {
        image: image.display().to_string(),
        flash_size: geometry.flash_size,
        sector_size: geometry.sector_size,
        page_size: geometry.page_size,
        bad_blocks: flash.bad_blocks().into_iter().map(|b| b.0).collect(),
        volume: volume.stats(),
    };
    print_report(&report, opts.json, |r| {
        println!("FrankenFlash image");
        println!("image: {}", r.image);
        println!("flash_size: {}", r.flash_size);
        println!("sector_size: {}", r.sector_size);
        println!("page_size: {}", r.page_size);
        println!("bad_blocks: {:?}", r.bad_blocks);
        print_space(&r.volume);
    })
}

// ── simulate ────────────────────────────────────────────────────────────────

/// xorshift64*. A seed always replays the same workload.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: u32) -> u32 {
        (self.next() % u64::from(n.max(1))) as u32
    }
}

#[derive(Debug, Default, Serialize)]
struct WorkloadCounts {
    writes: u64,
    bytes_written: u64,
    truncates: u64,
    deletes: u64,
    syncs: u64,
    no_space: u64,
    reclaim_steps: u64,
}

#[derive(Debug, Serialize)]
struct SimulateReport {
    ops: u32,
    seed: u64,
    workload: WorkloadCounts,
    flash: FlashStats,
    volume: VolumeStats,
}

fn simulate_cmd(opts: &Options) -> Result<()> {
    let geometry = opts.layout.geometry()?;
    let config = load_config(opts.config.as_deref())?;
    let flash = Arc::new(MemFlash::new(geometry));
    let volume = Volume::format(Arc::clone(&flash) as Arc<dyn FlashDevice>, config)
        .context("failed to format simulated flash")?;

    // At most a quarter of the medium is live at any time.
    let files = (geometry.block_count() / 8).clamp(1, 64);
    let max_file = (geometry.sector_size * 2).min(256 * 1024);
    let mut rng = Rng::new(opts.seed);
    let mut counts = WorkloadCounts::default();

    for op in 0..opts.ops {
        let ino = InodeNumber(1 + rng.below(files));
        let roll = rng.below(100);
        let result = match roll {
            0..=79 => {
                let offset = rng.below(max_file);
                let len = 1 + rng.below((max_file - offset).min(8192));
                let fill = (op % 251) as u8;
                let data = vec![fill; len as usize];
                counts.bytes_written += u64::from(len);
                counts.writes += 1;
                volume.write_data(ino, offset, &data).map(|_| ())
            }
            80..=89 => match volume.file_size(ino) {
                Some(size) => {
                    counts.truncates += 1;
                    volume.truncate(ino, rng.below(size + 1))
                }
                None => Ok(()),
            },
            90..=94 => match volume.file_size(ino) {
                Some(_) => {
                    counts.deletes += 1;
                    volume.delete_inode(ino)
                }
                None => Ok(()),
            },
            _ => {
                counts.syncs += 1;
                volume.sync()
            }
        };
        match result {
            Ok(()) => {}
            Err(FflError::NoSpace) => {
                counts.no_space += 1;
                tracing::debug!(target: "ffl::cli", op, ino = ino.0, "simulate_no_space");
                volume
                    .delete_inode(ino)
                    .or_else(|err| match err {
                        FflError::NotFound(_) => Ok(()),
                        err => Err(err),
                    })
                    .with_context(|| format!("op {op}: deleting inode {ino} after ENOSPC"))?;
            }
            Err(err) => return Err(err).with_context(|| format!("op {op} on inode {ino}")),
        }
        while volume.should_wake() {
            counts.reclaim_steps += 1;
            if !volume.reclaim_step().with_context(|| format!("reclaim after op {op}"))? {
                break;
            }
        }
    }
    volume.sync().context("final sync")?;
    volume
        .check_accounting()
        .context("space accounting is inconsistent after the workload")?;
    tracing::info!(target: "ffl::cli", ops = opts.ops, seed = opts.seed, "simulation_finished");

    let report = SimulateReport {
        ops: opts.ops,
        seed: opts.seed,
        workload: counts,
        flash: flash.stats(),
        volume: volume.stats(),
    };
    print_report(&report, opts.json, |r| {
        println!("FrankenFlash simulation");
        println!("ops: {}", r.ops);
        println!("seed: {}", r.seed);
        println!("writes: {}", r.workload.writes);
        println!("bytes_written: {}", r.workload.bytes_written);
        println!("truncates: {}", r.workload.truncates);
        println!("deletes: {}", r.workload.deletes);
        println!("syncs: {}", r.workload.syncs);
        println!("no_space: {}", r.workload.no_space);
        println!("reclaim_steps: {}", r.workload.reclaim_steps);
        println!("flash.erases: {}", r.flash.erases);
        println!("flash.bytes_written: {}", r.flash.bytes_written);
        println!("files: {}", r.volume.files);
        print_space(&r.volume);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn options_parse_numbers_and_positionals() {
        let opts = parse_options(args(&["img", "--sector", "4096", "--blocks", "16", "--json"]))
            .expect("parse");
        assert_eq!(opts.positional, vec!["img".to_owned()]);
        assert_eq!(opts.layout.sector, 4096);
        assert_eq!(opts.layout.blocks, 16);
        assert_eq!(opts.layout.page, DEFAULT_PAGE);
        assert!(opts.json);
    }

    #[test]
    fn options_reject_unknown_flags_and_missing_values() {
        assert!(parse_options(args(&["--bogus"])).is_err());
        assert!(parse_options(args(&["--ops"])).is_err());
        assert!(parse_options(args(&["--ops", "many"])).is_err());
    }

    #[test]
    fn rng_is_deterministic() {
        let mut a = Rng::new(7);
        let mut b = Rng::new(7);
        for _ in 0..16 {
            assert_eq!(a.next(), b.next());
        }
        assert!(Rng::new(0).below(10) < 10);
    }

    #[test]
    fn small_simulation_stays_consistent() {
        let opts = parse_options(args(&["--blocks", "32", "--sector", "4096", "--ops", "300"]))
            .expect("parse");
        simulate_cmd(&opts).expect("simulate");
    }

    #[test]
    fn format_writes_an_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("flash.img");
        let opts = parse_options(args(&["--sector", "4096", "--blocks", "8"])).expect("parse");
        format_cmd(&image, &opts).expect("format");
        let len = std::fs::metadata(&image).expect("metadata").len();
        assert_eq!(len, 8 * 4096);
    }
}
