use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use kwaymerge::{FileStreamFactory, KWayMergeSorterBuilder, PodSerializer};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let input = arg_parser.value_of("input").expect("value is defaulted").to_string();
    let output = arg_parser.value_of("output").expect("value is defaulted").to_string();
    let memory_limit_mb: u64 = arg_parser.value_of_t_or_exit("memory_limit_mb");
    let fan_out: u64 = arg_parser.value_of_t_or_exit("k");
    let io_buffer_records: u64 = arg_parser.value_of_t_or_exit("io_buffer_records");
    let temp_dir = arg_parser.value_of("temp_dir").expect("value is defaulted").to_string();

    if let Err(err) = run(input, output, memory_limit_mb, fan_out, io_buffer_records, temp_dir, order) {
        log::error!("sorting failed: {}", err);
        process::exit(1);
    }
}

fn run(
    input: String,
    output: String,
    memory_limit_mb: u64,
    fan_out: u64,
    io_buffer_records: u64,
    temp_dir: String,
    order: Order,
) -> kwaymerge::Result<()> {
    let memory_limit_bytes = memory_limit_mb * 1024 * 1024;
    log::info!(
        "sorting '{}' into '{}' (budget: {}, k: {}, buffer: {} records, temp dir: '{}')",
        input,
        output,
        ByteSize(memory_limit_bytes),
        fan_out,
        io_buffer_records,
        temp_dir
    );

    let mut factory: FileStreamFactory<u64, _> =
        FileStreamFactory::new(temp_dir, PodSerializer::default())?;

    let sorter = KWayMergeSorterBuilder::<u64, PodSerializer<u64>>::new()
        .with_memory_limit(memory_limit_bytes)
        .with_fan_out(fan_out)
        .with_io_buffer_elements(io_buffer_records)
        .ascending(matches!(order, Order::Asc))
        .build(&mut factory, input, output.clone())?;

    sorter.sort()?;

    log::info!("sorting completed, output written to '{}'", output);
    return Ok(());
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_number(value: &str) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("not an unsigned integer: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("kwaymerge")
        .about("k-way external merge sorter for binary u64 sequences")
        .arg(
            clap::Arg::new("input")
                .index(1)
                .help("file to be sorted")
                .default_value("input.bin"),
        )
        .arg(
            clap::Arg::new("output")
                .index(2)
                .help("result file")
                .default_value("output.bin"),
        )
        .arg(
            clap::Arg::new("memory_limit_mb")
                .index(3)
                .help("memory budget for run creation, in megabytes")
                .default_value("64")
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("k")
                .index(4)
                .help("merge fan-out (minimum 2)")
                .default_value("16")
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("io_buffer_records")
                .index(5)
                .help("per-stream buffer capacity in records")
                .default_value("1024")
                .validator(validate_number),
        )
        .arg(
            clap::Arg::new("temp_dir")
                .index(6)
                .help("directory for intermediate runs")
                .default_value("temp_sorting"),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
