use time::macros::format_description;
use tracing::{Level, level_filters::LevelFilter};
use tracing_subscriber::{
	fmt::time::LocalTime, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Log to stderr; stdout is the data path.
pub fn init_log(verbose: u8) -> eyre::Result<()> {
	let level = match verbose {
		0 => Level::INFO,
		1 => Level::DEBUG,
		_ => Level::TRACE,
	};
	let filter = tracing_subscriber::filter::Targets::new()
		.with_targets(vec![
			("goncat", level),
			("goncat_core", level),
			("goncat_proto", level),
			("goncat_mux", level),
			("goncat_transport", level),
			("goncat_session", level),
		])
		.with_default(LevelFilter::WARN);
	let registry = tracing_subscriber::registry();
	registry
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_writer(std::io::stderr)
				.with_timer(LocalTime::new(format_description!(
					"[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
				))),
		)
		.try_init()?;

	Ok(())
}
