use crate::CLAP_STYLING;
use clap::{arg, command};

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("maphound")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("maphound")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("crawl")
                .about(
                    "Sweep a bounding box with a grid of search probes, refining dense cells \
                and checkpointing progress.",
                )
                .arg(
                    arg!(-g --"grid-size" <N>)
                        .required(false)
                        .help("Grid dimension; the sweep covers N x N probes")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("15"),
                )
                .arg(
                    arg!(-z --"zoom" <LEVEL>)
                        .required(false)
                        .help("Base zoom level for the initial grid")
                        .value_parser(clap::value_parser!(u8))
                        .default_value("15"),
                )
                .arg(
                    arg!(--"max-results" <N>)
                        .required(false)
                        .help("Result-card ceiling per probe (the scroll-depth equivalent)")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("500"),
                )
                .arg(
                    arg!(-t --"threads" <NUM_FETCHES>)
                        .required(false)
                        .help("Overlapping fetch ceiling (kept low on purpose; 1-3)")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    arg!(--"resume")
                        .required(false)
                        .help("Resume from the checkpoint instead of starting fresh")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-c --"checkpoint" <PATH>)
                        .required(false)
                        .help("Checkpoint file location")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .default_value("maphound-checkpoint.json"),
                )
                .arg(
                    arg!(-p --"platform" <NAME>)
                        .required(false)
                        .help("Platform budget table to apply (e.g. google_maps)")
                        .default_value("google_maps"),
                )
                .arg(
                    arg!(--"bbox" <CORNERS>)
                        .required(false)
                        .help("Bounding box as NE_LAT,NE_LNG,SW_LAT,SW_LNG (default: Istanbul)"),
                )
                .arg(
                    arg!(--"search-url" <TEMPLATE>)
                        .required(false)
                        .help("Search URL template with {lat}, {lng} and {zoom} placeholders"),
                )
                .arg(
                    arg!(--"proxy-api" <URL>)
                        .required(false)
                        .help("Proxy supplier API base URL (or MAPHOUND_PROXY_API)"),
                )
                .arg(
                    arg!(--"proxy-api-key" <KEY>)
                        .required(false)
                        .help("Proxy supplier API key (or MAPHOUND_PROXY_API_KEY)"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save the run report to a file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            command!("checkpoint")
                .about("Inspect or reset the durable crawl checkpoint")
                .subcommand(
                    command!("show").about("Show checkpoint contents").arg(
                        arg!(-c --"checkpoint" <PATH>)
                            .required(false)
                            .help("Checkpoint file location")
                            .value_parser(clap::value_parser!(std::path::PathBuf))
                            .default_value("maphound-checkpoint.json"),
                    ),
                )
                .subcommand(
                    command!("clear").about("Delete the checkpoint file").arg(
                        arg!(-c --"checkpoint" <PATH>)
                            .required(false)
                            .help("Checkpoint file location")
                            .value_parser(clap::value_parser!(std::path::PathBuf))
                            .default_value("maphound-checkpoint.json"),
                    ),
                ),
        )
}
