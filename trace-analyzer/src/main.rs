//! Offline analyzer for the binary trace a `frigg_slab::classic::Pool`
//! emits when built with the `trace` feature and a policy that opts in.
//!
//! Pairs allocation records to deallocation records by pointer, flags a
//! pointer allocated twice without an intervening free and a free of a
//! pointer that was never allocated, groups the allocations left unmatched
//! by stack, and symbolicates each stack through an external `addr2line`
//! process piped over stdin/stdout.

mod decode;

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::Parser;

use decode::{decode, RecordKind};

#[derive(Parser)]
#[command(name = "trace-analyzer", about = "Analyze a frigg-slab allocation trace")]
struct Cli {
    /// Path to the binary trace file written by the allocator.
    trace_file: PathBuf,
    /// Path to the executable the trace was recorded against, used to
    /// resolve return addresses via addr2line.
    executable: PathBuf,
}

fn print_stack(stack: &[u64]) {
    for p in stack {
        println!("\t{p:016x}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data = fs::read(&cli.trace_file)
        .with_context(|| format!("failed to read trace file {}", cli.trace_file.display()))?;
    let records = decode(&data);

    // ptr -> index of the unmatched allocation record in `records`.
    let mut unmatched: HashMap<u64, usize> = HashMap::new();

    for (idx, record) in records.iter().enumerate() {
        match record.kind {
            RecordKind::Allocation => {
                if let Some(&prev) = unmatched.get(&record.ptr) {
                    println!("same address allocated again without matching free for previous call?");
                    println!("address {:016x} got allocated again despite not being freed!", record.ptr);
                    println!("first allocation from:");
                    print_stack(&records[prev].stack);
                    println!("allocation again from:");
                    print_stack(&record.stack);
                } else {
                    unmatched.insert(record.ptr, idx);
                }
            }
            RecordKind::Deallocation => {
                if unmatched.remove(&record.ptr).is_some() {
                    // matched
                } else if record.ptr != 0 {
                    println!("deallocation of an address that wasn't allocated?");
                    println!("address {:016x} isn't allocated anywhere at this point!", record.ptr);
                    println!("deallocated from:");
                    print_stack(&record.stack);
                }
            }
        }
    }

    let total_leaked_allocations = unmatched.len();

    let mut grouped: HashMap<Vec<u64>, Vec<u64>> = HashMap::new();
    for &idx in unmatched.values() {
        let record = &records[idx];
        grouped.entry(record.stack.clone()).or_default().push(record.size);
    }

    let mut leaks: Vec<(Vec<u64>, Vec<u64>)> = grouped.into_iter().collect();
    leaks.sort_by_key(|(_, sizes)| sizes.iter().sum::<u64>());

    let mut child = Command::new("/usr/bin/addr2line")
        .arg("-Cpfse")
        .arg(&cli.executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to spawn /usr/bin/addr2line")?;

    let mut child_stdin = child.stdin.take().expect("addr2line stdin was piped");
    let mut child_stdout = BufReader::new(child.stdout.take().expect("addr2line stdout was piped"));

    let mut total_all = 0u64;

    for (stack, sizes) in &leaks {
        let total: u64 = sizes.iter().sum();
        let avg = total / sizes.len() as u64;
        total_all += total;

        print!(
            "{} potential leak(s) found of average size {avg}, total size {total}, and all sizes:\n  ",
            sizes.len()
        );

        let mut sorted = sizes.clone();
        sorted.sort_unstable();
        let mut i = 0;
        while i < sorted.len() {
            let value = sorted[i];
            let n = sorted[i..].iter().take_while(|&&v| v == value).count();
            if n == 1 {
                print!("{value}");
            } else {
                print!("{n}x {value}");
            }
            i += n;
            if i < sorted.len() {
                print!(", ");
            }
        }
        println!();

        println!("  found in:");
        let mut line = String::new();
        for (i, &p) in stack.iter().enumerate() {
            // Resolve the instruction preceding the call, not the return
            // address itself, for every frame but the innermost.
            let query = if p == 0 || i == 0 { p } else { p - 1 };
            writeln!(child_stdin, "0x{query:016x}").context("failed to write to addr2line")?;
            child_stdin.flush().context("failed to flush addr2line stdin")?;

            line.clear();
            child_stdout.read_line(&mut line).context("failed to read from addr2line")?;
            print!("\t{p:016x} -> {line}");
        }
        println!("--------------------------------------\n");
    }

    drop(child_stdin);
    let _ = child.kill();
    child.wait().context("failed to wait for addr2line")?;

    println!("total potential leaks: {total_leaked_allocations}, which is {total_all} bytes");

    Ok(())
}
