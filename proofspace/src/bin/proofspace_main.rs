//! Proof-of-space command line utility.
//!
//! Usage:
//!   proofspace create -k 25 -r 2 -b 4608 -u 64 -t /tmp -2 /tmp -d .
//!   proofspace prove <challenge-hex>
//!   proofspace verify <proof-hex> <challenge-hex>
//!   proofspace check [iterations]

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use proofspace::constants::K_ID_LEN;
use proofspace::plotter::{DiskPlotter, PlotParams};
use proofspace::prover::DiskProver;
use proofspace::verifier::validate_proof;
use proofspace::{PosError, Result};

const DEFAULT_MEMO: &str = "b523cd9d58972af56ba6d5d61ccdf77e76894bafa5df3785055334e98e9b7dca\
                            cf21d41c491d2d876767df304e2742ae939df12309be853da848961b2089f9c3\
                            620622a1f2e49fd0fa74f228a006367000e58d3ded9df8004de5c54acada4380\
                            5d18adec05f526be9cfc7aba062ac22608a05495c153b54bae4e46002f5295c0";
const DEFAULT_ID: &str = "fa1e527bc1d8070876ddb40b4cd50c1d8dacf4d361e71fb61fd613b65c64b506";

#[derive(Parser, Debug)]
#[command(name = "proofspace")]
#[command(about = "Utility for plotting, generating and verifying proofs of space")]
#[command(version)]
struct Cli {
    /// Plot size
    #[arg(short = 'k', long = "size", global = true, default_value_t = 20)]
    k: u32,

    /// Number of threads
    #[arg(short = 'r', long = "threads", global = true, default_value_t = 0)]
    threads: u8,

    /// Number of buckets
    #[arg(short = 'u', long = "buckets", global = true, default_value_t = 0)]
    buckets: u32,

    /// Size of stripes
    #[arg(short = 's', long = "stripes", global = true, default_value_t = 0)]
    stripes: u64,

    /// Temporary directory
    #[arg(short = 't', long = "tempdir", global = true, default_value = ".")]
    tempdir: PathBuf,

    /// Second temporary directory
    #[arg(short = '2', long = "tempdir2", global = true, default_value = ".")]
    tempdir2: PathBuf,

    /// Final directory
    #[arg(short = 'd', long = "finaldir", global = true, default_value = ".")]
    finaldir: PathBuf,

    /// Filename
    #[arg(short = 'f', long = "file", global = true, default_value = "plot.dat")]
    filename: String,

    /// Memo to insert into the plot (hex)
    #[arg(short = 'm', long = "memo", global = true, default_value = DEFAULT_MEMO)]
    memo: String,

    /// Unique 32-byte seed for the plot (hex)
    #[arg(short = 'i', long = "id", global = true, default_value = DEFAULT_ID)]
    id: String,

    /// Disable bitfield backpropagation
    #[arg(short = 'e', long = "nobitfield", global = true)]
    nobitfield: bool,

    /// Megabytes to be used as buffer for sorting and plotting
    #[arg(short = 'b', long = "buffer", global = true, default_value_t = 0)]
    buffer: u32,

    /// Display progress during plotting
    #[arg(short = 'p', long = "progress", global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a plot
    Create,
    /// Generate proofs of space for a challenge
    Prove {
        /// 32-byte challenge (hex)
        challenge: String,
    },
    /// Verify a proof of space against a challenge
    Verify {
        /// Proof (hex, 8k bytes)
        proof: String,
        /// 32-byte challenge (hex)
        challenge: String,
    },
    /// Prove and verify hashed challenges against an existing plot
    Check {
        /// Number of challenges to try
        iterations: Option<u32>,
    },
}

fn main() {
    let cli = Cli::parse();
    let mut builder = env_logger::Builder::from_default_env();
    if cli.progress {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Create => create(&cli),
        Command::Prove { challenge } => prove(&cli, challenge),
        Command::Verify { proof, challenge } => verify(&cli, proof, challenge),
        Command::Check { iterations } => check(&cli, iterations.unwrap_or(1000)),
    }
}

fn strip_0x(hex: &str) -> &str {
    hex.strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex)
}

fn parse_hex(what: &str, hex: &str) -> Result<Vec<u8>> {
    hex::decode(strip_0x(hex))
        .map_err(|e| PosError::InvalidValue(format!("invalid {what} hex: {e}")))
}

fn parse_id(hex: &str) -> Result<[u8; K_ID_LEN]> {
    let bytes = parse_hex("id", hex)?;
    <[u8; K_ID_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| PosError::InvalidValue("Invalid ID, should be 32 bytes (hex)".into()))
}

fn parse_challenge(hex: &str) -> Result<[u8; 32]> {
    let bytes = parse_hex("challenge", hex)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| PosError::InvalidValue("Invalid challenge, should be 32 bytes".into()))
}

fn create(cli: &Cli) -> Result<()> {
    println!(
        "Generating plot for k={} filename={} id={}",
        cli.k, cli.filename, cli.id
    );
    let id = parse_id(&cli.id)?;
    let memo = parse_hex("memo", &cli.memo)?;

    let mut params = PlotParams::new(
        cli.tempdir.clone(),
        cli.tempdir2.clone(),
        cli.finaldir.clone(),
        cli.filename.clone(),
        cli.k,
        memo,
        id,
    );
    params.buffer_mib = cli.buffer;
    params.num_buckets = cli.buckets;
    params.stripe_size = cli.stripes;
    params.num_threads = cli.threads;
    params.bitfield = !cli.nobitfield;

    let final_path = DiskPlotter::new().create_plot_disk(&params)?;
    println!("Wrote plot to {}", final_path.display());
    Ok(())
}

fn plot_path(cli: &Cli) -> PathBuf {
    let p = Path::new(&cli.filename);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cli.finaldir.join(p)
    }
}

fn prove(cli: &Cli, challenge: &str) -> Result<()> {
    println!(
        "Proving using filename={} challenge={challenge}",
        cli.filename
    );
    let challenge = parse_challenge(challenge)?;
    let prover = DiskProver::new(&plot_path(cli))?;
    let qualities = prover.get_qualities_for_challenge(&challenge)?;
    for index in 0..qualities.len() {
        let proof = prover.get_full_proof(&challenge, index)?;
        println!("Proof: 0x{}", hex::encode(proof));
    }
    if qualities.is_empty() {
        println!("No proofs found.");
        return Err(PosError::NoProof);
    }
    Ok(())
}

fn verify(cli: &Cli, proof: &str, challenge: &str) -> Result<()> {
    let id = parse_id(&cli.id)?;
    let proof = parse_hex("proof", proof)?;
    let challenge_bytes = parse_challenge(challenge)?;
    if proof.is_empty() || proof.len() % 8 != 0 {
        return Err(PosError::InvalidValue(
            "Invalid proof, should be a multiple of 8 bytes".into(),
        ));
    }
    let k = (proof.len() / 8) as u32;
    println!("Verifying proof={} for challenge={challenge} and k={k}", hex::encode(&proof));

    match validate_proof(&id, k, &challenge_bytes, &proof) {
        Some(quality) => {
            println!(
                "Proof verification succeeded. Quality: {}",
                hex::encode(quality)
            );
            Ok(())
        }
        None => {
            println!("Proof verification failed.");
            Err(PosError::InvalidProof)
        }
    }
}

fn check(cli: &Cli, iterations: u32) -> Result<()> {
    let prover = DiskProver::new(&plot_path(cli))?;
    let id = *prover.id();
    let k = prover.size();

    let mut success = 0u32;
    for num in 0..iterations {
        let mut hasher = Sha256::new();
        hasher.update(num.to_be_bytes());
        hasher.update(id);
        let challenge: [u8; 32] = hasher.finalize().into();

        let qualities = match prover.get_qualities_for_challenge(&challenge) {
            Ok(q) => q,
            Err(e) => {
                println!("Threw: {e}");
                continue;
            }
        };
        for (index, quality) in qualities.iter().enumerate() {
            let proof = match prover.get_full_proof(&challenge, index) {
                Ok(p) => p,
                Err(e) => {
                    println!("Threw: {e}");
                    continue;
                }
            };
            println!("i: {num}");
            println!("challenge: 0x{}", hex::encode(challenge));
            println!("proof: 0x{}", hex::encode(&proof));
            match validate_proof(&id, k, &challenge, &proof) {
                Some(verified) if &verified == quality => {
                    println!("quality: {}", hex::encode(verified));
                    println!("Proof verification succeeded. k = {k}");
                    success += 1;
                }
                _ => println!("Proof verification failed."),
            }
        }
    }
    println!(
        "Total success: {success}/{iterations}, {:.2}%.",
        success as f64 * 100.0 / iterations as f64
    );
    Ok(())
}
