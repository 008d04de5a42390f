use commands::command_argument_builder;
use maphound_core::print_banner;

mod commands;
mod handlers;

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    match chosen_command.subcommand() {
        Some(("crawl", primary_command)) => {
            let code = handlers::handle_crawl(primary_command).await;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Some(("checkpoint", primary_command)) => match primary_command.subcommand() {
            Some(("show", secondary_command)) => handlers::handle_checkpoint_show(secondary_command),
            Some(("clear", secondary_command)) => {
                handlers::handle_checkpoint_clear(secondary_command)
            }
            _ => unreachable!("clap should ensure we don't get here"),
        },
        None => {
            // No subcommand provided, just show the banner
        }
        _ => unreachable!("clap should ensure we don't get here"),
    }
}
