use std::{
    env,
    fs::{read, read_dir, OpenOptions},
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use chrono::Local;
use clap::{value_parser, Arg, ArgMatches, Command};
use lazy_static::lazy_static;
use log::{info, warn, LevelFilter, Log, Metadata, Record};

use bcache::{
    device::BlockFile,
    fs::{Bcache, BlockDevice, ImageBuilder, PagePool, BLOCK_CACHE_SIZE, BLOCK_SIZE},
};

/// 默认镜像大小, 与 easy-fs 打包工具一致
const BLOCK_NUM: u32 = 0x4000;
/// 默认可预载区域的块数
const PRELOAD_BLOCKS: u32 = 0x1000;

/// 输出到标准错误的日志, 级别由环境变量 BCACHE_LOG 控制
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{} [{:>5}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

lazy_static! {
    static ref LOGGER: ConsoleLogger = ConsoleLogger;
}

fn init_logger() {
    let level = env::var("BCACHE_LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> io::Result<()> {
    init_logger();

    let matches = Command::new("bcache")
        .about("Pack and inspect disk images with preloaded user program blocks")
        .subcommand_required(true)
        .subcommand(
            Command::new("pack")
                .about("Build an image and preload every file in a directory")
                .arg(
                    // source 参数
                    Arg::new("source")
                        .short('s')
                        .long("source")
                        .required(true)
                        .help("Directory of user programs"),
                )
                .arg(
                    // target 参数
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .required(true)
                        .help("Image file to create"),
                )
                .arg(
                    Arg::new("blocks")
                        .long("blocks")
                        .value_parser(value_parser!(u32))
                        .help("Total blocks of the image"),
                )
                .arg(
                    Arg::new("preload-blocks")
                        .long("preload-blocks")
                        .value_parser(value_parser!(u32))
                        .help("Size of the preload region in blocks"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Mount an image and list its preloaded blocks")
                .arg(
                    Arg::new("image")
                        .short('i')
                        .long("image")
                        .required(true)
                        .help("Image file to mount"),
                )
                .arg(
                    Arg::new("nbuf")
                        .long("nbuf")
                        .value_parser(value_parser!(usize))
                        .help("Buffers in the ordinary cache"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("pack", matches)) => pack(matches),
        Some(("inspect", matches)) => inspect(matches),
        _ => Err(invalid("unknown subcommand")),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.to_string())
}

fn path_arg(matches: &ArgMatches, name: &str) -> io::Result<PathBuf> {
    matches
        .get_one::<String>(name)
        .map(PathBuf::from)
        .ok_or_else(|| invalid(&format!("missing --{}", name)))
}

/// 在 target 上创建镜像, 把 source 目录下的每个文件作为用户程序写入可预载区域
fn pack(matches: &ArgMatches) -> io::Result<()> {
    let src_path = path_arg(matches, "source")?;
    let target_path = path_arg(matches, "target")?;
    let total_blocks = matches.get_one::<u32>("blocks").copied().unwrap_or(BLOCK_NUM);
    let preload_blocks = matches
        .get_one::<u32>("preload-blocks")
        .copied()
        .unwrap_or(PRELOAD_BLOCKS);
    info!("pack: {} -> {}", src_path.display(), target_path.display());

    // 创建虚拟块设备, 容量为 total_blocks 个块, 需要可读可写
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&target_path)?;
    file.set_len(total_blocks as u64 * BLOCK_SIZE as u64)?;
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new(file)));
    let bcache = Bcache::new(BLOCK_CACHE_SIZE, vec![block_file]);

    let region = ImageBuilder::default_region(total_blocks, preload_blocks);
    let mut builder = ImageBuilder::create(&bcache, 0, total_blocks, region);

    // 按文件名排序, 保证同一个目录打出的镜像相同
    let mut apps = read_dir(&src_path)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()?;
    apps.retain(|app| app.is_file());
    apps.sort();

    let mut packed = 0;
    for app in apps {
        let all_data = read(&app)?;
        match builder.install(&all_data) {
            Some(blocks) => {
                packed += 1;
                println!(
                    "{:<24} {:>8} bytes {:>5} blocks from {}",
                    app.file_name().unwrap_or_default().to_string_lossy(),
                    all_data.len(),
                    blocks.len(),
                    blocks.first().copied().unwrap_or_default()
                );
            }
            None => warn!("pack: no room left for {}", app.display()),
        }
    }

    let sb = builder.superblock();
    println!(
        "{}: packed {} programs into {}, {} blocks preloaded, {} free",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        packed,
        target_path.display(),
        sb.preload_count,
        builder.free_blocks()
    );
    Ok(())
}

/// 挂载镜像, 列出预载区中的块并确认它们都由预载区提供
fn inspect(matches: &ArgMatches) -> io::Result<()> {
    let image_path = path_arg(matches, "image")?;
    let nbuf = matches
        .get_one::<usize>("nbuf")
        .copied()
        .unwrap_or(BLOCK_CACHE_SIZE);
    if nbuf == 0 {
        return Err(invalid("--nbuf must be at least 1"));
    }

    let file = OpenOptions::new().read(true).write(true).open(&image_path)?;
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new(file)));
    let bcache = Bcache::new(nbuf, vec![block_file]);
    let store = bcache.bootstrap(0, &PagePool::unbounded());

    println!("{:#?}", store.superblock());
    for blockno in store.blocks() {
        let buf = bcache.bread(0, blockno);
        let head = &buf.data().as_bytes()[..8];
        println!(
            "{:>8} {} {:02x?}",
            blockno,
            if buf.is_preloaded() { "preloaded" } else { "ordinary " },
            head
        );
    }
    println!(
        "{}: {} blocks resident, {} ordinary buffers",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        store.len(),
        bcache.capacity()
    );
    Ok(())
}
