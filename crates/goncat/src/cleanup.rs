//! Best-effort self-removal for `slave --cleanup`.

use tracing::debug;

pub fn self_delete() {
	let Ok(exe) = std::env::current_exe() else {
		return;
	};
	debug!(target: "[MAIN]", "removing {}", exe.display());
	#[cfg(unix)]
	{
		let _ = std::fs::remove_file(&exe);
	}
	#[cfg(windows)]
	{
		// The image is locked while we run; a detached shell deletes it
		// once we are gone.
		let _ = std::process::Command::new("cmd")
			.arg("/C")
			.arg(format!("ping -n 3 127.0.0.1 > nul & del /f /q \"{}\"", exe.display()))
			.spawn();
	}
}
