use propagator::propagator::{
    analyze_block, analyze_function, AnalysisContext, KnowledgeBase, Propagation,
};
use propagator::{arch, config, listing_lifter, log};

use std::path::PathBuf;

use clap::Parser;

/// Propagate constants and expressions through lifted binary code
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Propagate over functions given as a textual structured-IR listing
    FromListing {
        /// Path to the listing (see `listing_lifter` for its format)
        listing: PathBuf,
        /// Architecture the listing was lifted from
        #[clap(long, default_value = "amd64")]
        arch: String,
        /// Only record constants as replacements
        #[clap(long)]
        only_consts: bool,
        /// Maximum number of times any block is processed
        #[clap(long)]
        max_iterations: Option<usize>,
        /// Analyze each block on its own rather than whole functions. Temporaries are only
        /// propagated in this mode.
        #[clap(long)]
        block: bool,
        /// Path to output file for the replacements and equivalences
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output each analyzed function, annotated with its replacements, as a GraphViz `.dot`
        /// file into the given directory
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the propagation behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            arch,
            only_consts,
            max_iterations,
            block,
            output,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            let arch = arch::Arch::from_name(&arch)
                .unwrap_or_else(|| panic!("Unsupported architecture {:?}", arch));
            let mut config = config::PropagatorConfig::from(advanced_config);
            config.only_consts |= only_consts;
            if let Some(max_iterations) = max_iterations {
                config.max_iterations = max_iterations;
            }

            let funcs = listing_lifter::lift_from(
                &std::fs::read_to_string(listing).expect("Listing file could not be read"),
            );

            let mut ctx = AnalysisContext::new(arch, config);
            ctx.completed_funcs = funcs.iter().map(|f| f.addr).collect();
            let mut kb = KnowledgeBase::new();

            let mut report = String::new();
            for func in &funcs {
                log::info!("Analyzing function"; "name" => &func.name, "addr" => format_args!("{:#x}", func.addr));
                let results = if block {
                    func.nodes()
                        .map(|(n, _)| analyze_block(&ctx, func, n))
                        .collect::<Result<Vec<_>, _>>()
                } else {
                    analyze_function(&ctx, func, Some(&mut kb)).map(|r| vec![r])
                };
                let results = match results {
                    Ok(r) => r,
                    Err(e) => {
                        log::error!("Propagation failed"; "name" => &func.name, "error" => %e);
                        continue;
                    }
                };

                report += &format!("# {} @ {:#x}\n", func.name, func.addr);
                for r in &results {
                    report += &r.to_string();
                }

                if let Some(dir) = &debug_output_graphviz {
                    use std::io::Write;
                    let merged = results.into_iter().fold(
                        Propagation::default(),
                        |mut acc, r| {
                            acc.replacements.extend(r.replacements);
                            acc.equivalence.extend(r.equivalence.into_vec());
                            acc
                        },
                    );
                    write!(
                        std::fs::File::create(dir.join(format!("{}.dot", func.name))).unwrap(),
                        "{}",
                        merged.generate_dot(func)
                    )
                    .unwrap();
                }
            }

            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", report).unwrap();
            } else {
                print!("{}", report);
            }

            log::trace!("Done");
        }
    }
}
