use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jbdbms_lib::reassembler::FrameReassembler;
use jbdbms_lib::serialport::JbdBms;
use jbdbms_lib::{BmsDecoder, Event};
use log::*;
use std::{io::BufRead, ops::Deref, panic};

mod capture;
mod commandline;
mod history;
mod monitor;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn open_bms(args: &commandline::CliArgs) -> Result<JbdBms> {
    let mut bms = JbdBms::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout);
    Ok(bms)
}

fn print_status(bms: &mut JbdBms) -> Result<()> {
    let status = bms.get_status().with_context(|| "Cannot get status")?;
    println!("{}", monitor::format_status(&status));
    Ok(())
}

fn print_cells(bms: &mut JbdBms) -> Result<()> {
    let cells = bms
        .get_cell_voltages()
        .with_context(|| "Cannot get cell voltages")?;
    println!("{}", monitor::format_cells(&cells));
    Ok(())
}

fn decode_capture(input: &str, length_prefixed: bool) -> Result<()> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Cannot open capture file '{input}'"))?;
        Box::new(std::io::BufReader::new(file))
    };
    let chunks = capture::read_chunks(reader)?;

    let reassembler = if length_prefixed {
        FrameReassembler::length_prefixed()
    } else {
        FrameReassembler::new()
    };
    let mut decoder = BmsDecoder::with_reassembler(reassembler);
    info!(
        "Decoding {} chunks with {:?} reassembly",
        chunks.len(),
        decoder.reassembler().mode()
    );
    for chunk in &chunks {
        for event in decoder.feed_bytes(chunk) {
            match event {
                Event::Status(status) => println!("{}\n", monitor::format_status(&status)),
                Event::CellVoltages(cells) => println!("{}\n", monitor::format_cells(&cells)),
                Event::DecodeError { reason, frame } => {
                    println!("Discarded {:02X?}: {reason}\n", frame.unwrap_or_default())
                }
            }
        }
    }
    if !decoder.reassembler().is_idle() {
        warn!(
            "Capture ends inside a frame, {} bytes left",
            decoder.reassembler().pending().len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match &args.command {
        commandline::CliCommands::Status => print_status(&mut open_bms(&args)?)?,
        commandline::CliCommands::Cells => print_cells(&mut open_bms(&args)?)?,
        commandline::CliCommands::All => {
            let mut bms = open_bms(&args)?;
            print_status(&mut bms)?;
            print_cells(&mut bms)?;
        }
        commandline::CliCommands::Decode {
            input,
            length_prefixed,
        } => decode_capture(input, *length_prefixed)?,
        commandline::CliCommands::Monitor {
            output,
            interval,
            save_period,
            retention,
            history_file,
            clear_history,
        } => monitor::run(
            open_bms(&args)?,
            output.clone(),
            *interval,
            *save_period,
            *retention,
            history_file.as_deref(),
            *clear_history,
        )?,
    }

    Ok(())
}
