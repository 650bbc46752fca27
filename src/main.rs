use anyhow::{Result, anyhow};
use clap::Parser;
use taskpeek::{logging, observer, options::Options};

fn main() -> Result<()> {
    // usage errors exit 1 like every other failure; --help and --version still exit 0
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => return Err(e.into()),
    };
    options.validate()?;
    logging::init(options.log_file.as_deref(), options.verbose)?;

    let config = options.harness_config();
    let mut stderr = std::io::stderr();
    let report = observer::run(&config, &mut stderr)?;

    eprint!("{report}");
    if !report.succeeded() {
        return Err(anyhow!("producer {} {}", report.pid, report.producer_exit));
    }

    Ok(())
}
