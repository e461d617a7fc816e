// luax-dbg: debug host for compiled luax chunks.
//
// usage: luax-dbg [options] [program.chunk.json]
//   -c, --cwd DIR          working directory for the program
//   -b, --bp FILE:LINE     preset breakpoint (repeatable)
//   -t, --tcp HOST:PORT    serve the protocol over TCP instead of stdio
//   -e, --stop-on-entry    pause at the first instruction
//   -d, --dump             print the chunk's bytecode and exit
//   -h, --help

use luax_debugger::{serve, SessionConfig, Transport};
use std::env;
use std::path::PathBuf;
use std::process::exit;

fn print_usage() {
    eprintln!("usage: luax-dbg [options] [program.chunk.json]");
    eprintln!("Available options are:");
    eprintln!("  -c, --cwd DIR        working directory for the program");
    eprintln!("  -b, --bp FILE:LINE   preset breakpoint (repeatable)");
    eprintln!("  -t, --tcp HOST:PORT  serve over TCP instead of stdio");
    eprintln!("  -e, --stop-on-entry  pause at the first instruction");
    eprintln!("  -d, --dump           print the chunk's bytecode and exit");
}

fn parse_breakpoint(text: &str) -> Option<(String, u32)> {
    let (file, line) = text.rsplit_once(':')?;
    let line = line.parse().ok()?;
    Some((file.to_string(), line))
}

fn dump_chunk(path: &PathBuf) -> i32 {
    let proto = match luax::lua_value::chunk_io::load_chunk_file(path) {
        Ok(p) => p,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };
    fn dump(proto: &std::sync::Arc<luax::Prototype>, depth: usize) {
        let indent = "  ".repeat(depth);
        println!(
            "{}function <{}> ({} instructions, {} params{})",
            indent,
            proto.chunk_name,
            proto.code_len(),
            proto.param_count,
            if proto.is_vararg { ", vararg" } else { "" },
        );
        let code = proto.code_snapshot();
        for (index, instr) in code.iter().enumerate() {
            println!(
                "{}  [{:>4}] line {:<4} {}",
                indent,
                index,
                proto.line_of(index),
                luax::Instruction::disassemble(*instr, proto),
            );
        }
        for child in &proto.protos {
            dump(child, depth + 1);
        }
    }
    dump(&proto, 0);
    0
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut config = SessionConfig::default();
    let mut transport = Transport::Stdio;
    let mut dump = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                exit(0);
            }
            "-c" | "--cwd" => match args.next() {
                Some(dir) => config.cwd = Some(PathBuf::from(dir)),
                None => {
                    eprintln!("missing argument for {}", arg);
                    exit(2);
                }
            },
            "-b" | "--bp" => match args.next().as_deref().and_then(parse_breakpoint) {
                Some(bp) => config.breakpoints.push(bp),
                None => {
                    eprintln!("breakpoints are written FILE:LINE");
                    exit(2);
                }
            },
            "-t" | "--tcp" => match args.next() {
                Some(addr) => transport = Transport::Tcp(addr),
                None => {
                    eprintln!("missing argument for {}", arg);
                    exit(2);
                }
            },
            "-e" | "--stop-on-entry" => config.stop_on_entry = true,
            "-d" | "--dump" => dump = true,
            _ if arg.starts_with('-') => {
                eprintln!("unknown option '{}'", arg);
                print_usage();
                exit(2);
            }
            _ => config.default_program = Some(PathBuf::from(arg)),
        }
    }

    if dump {
        match &config.default_program {
            Some(program) => exit(dump_chunk(program)),
            None => {
                eprintln!("--dump requires a program");
                exit(2);
            }
        }
    }

    if let Err(e) = serve(transport, config) {
        eprintln!("luax-dbg: {}", e);
        exit(1);
    }
}
