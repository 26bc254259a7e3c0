use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "memmod", disable_help_subcommand = true)]
pub struct Args {
    /// Path to the PE image to load into memory
    #[arg(short = 'p', long = "pe", value_name = "FILE")]
    pub pe: String,

    /// Resolve this export (name, or decimal ordinal) and print its address
    #[arg(long = "proc", value_name = "NAME")]
    pub proc: Option<String>,

    /// Print the full export table
    #[arg(long = "exports")]
    pub exports: bool,

    /// Keep the image loaded until Enter is pressed
    #[arg(long = "wait")]
    pub wait: bool,
}

pub fn parse_args() -> Args {
    Args::parse()
}
