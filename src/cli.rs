//! Command-line argument parsing for imsakiyah

/// Parsed command line
#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub once: bool,
    pub validate: bool,
    pub help: bool,
    pub search: Option<String>,
    pub city: Option<String>,
    pub start: Option<String>,
    pub days: Option<usize>,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

/// Parse `args` (including the program name at index 0).
/// Unknown flags are ignored; a flag missing its value is ignored too.
pub fn parse_args_from(args: &[String]) -> Args {
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
        match args[i].as_str() {
            "--once" => result.once = true,
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            "--search" => {
                if value.is_some() {
                    i += 1;
                }
                result.search = value;
            }
            "--city" => {
                if value.is_some() {
                    i += 1;
                }
                result.city = value;
            }
            "--start" => {
                if value.is_some() {
                    i += 1;
                }
                result.start = value;
            }
            "--days" => {
                if value.is_some() {
                    i += 1;
                }
                result.days = value.and_then(|v| v.parse().ok());
            }
            _ => {}
        }
        i += 1;
    }

    result
}

pub fn print_help() {
    println!("imsakiyah - Ramadan prayer-time calendar and alarms\n");
    println!("USAGE:");
    println!("    imsakiyah [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --once                  Load the calendar, print it and exit");
    println!("    --search QUERY          Search locations by name and exit");
    println!("    --city ID               Location id (overrides CITY_ID)");
    println!("    --start YYYY-MM-DD      First calendar date (overrides START_DATE)");
    println!("    --days N                Number of days (overrides DAYS_COUNT)");
    println!("    --validate              Validate configuration and exit");
    println!("    --help, -h              Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    CITY_ID, TIMEZONE, NOTIFY_MODE, STATUS_PORT and friends; see README");
}
