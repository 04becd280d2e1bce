use std::{sync::Arc, time::Duration};

use snafu::Snafu;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum SemError {
	#[snafu(display("no free slot within {}ms", timeout.as_millis()))]
	Exhausted { timeout: Duration },
	#[snafu(display("cancelled while waiting for a slot"))]
	Cancelled,
}

/// Bounded counting semaphore whose acquires give up after a fixed wait.
///
/// Gates resources that must refuse work instead of queueing it
/// indefinitely: the operator's stdio (one shell at a time) and the
/// per-listener connection budget. Dropping the permit returns exactly
/// one slot.
#[derive(Clone)]
pub struct TimedSemaphore {
	inner:   Arc<Semaphore>,
	timeout: Duration,
}

impl TimedSemaphore {
	pub fn new(slots: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(Semaphore::new(slots)),
			timeout,
		}
	}

	pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, SemError> {
		tokio::select! {
			_ = cancel.cancelled() => CancelledSnafu.fail(),
			res = tokio::time::timeout(self.timeout, self.inner.clone().acquire_owned()) => match res {
				// The semaphore is never closed while a handle exists.
				Ok(Ok(permit)) => Ok(permit),
				Ok(Err(_)) => CancelledSnafu.fail(),
				Err(_) => ExhaustedSnafu { timeout: self.timeout }.fail(),
			},
		}
	}

	/// Grab a slot without waiting, for accept loops that drop surplus
	/// connections on the floor.
	pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
		self.inner.clone().try_acquire_owned().ok()
	}

	pub fn available(&self) -> usize {
		self.inner.available_permits()
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use tokio_util::sync::CancellationToken;

	use super::{SemError, TimedSemaphore};

	/// Holders never exceed the bound, and each release restores exactly
	/// one slot.
	#[tokio::test]
	async fn bound_is_exact() -> eyre::Result<()> {
		let sem = TimedSemaphore::new(3, Duration::from_millis(50));
		let cancel = CancellationToken::new();

		let a = sem.acquire(&cancel).await?;
		let _b = sem.acquire(&cancel).await?;
		let _c = sem.acquire(&cancel).await?;
		assert_eq!(sem.available(), 0);

		assert!(matches!(sem.acquire(&cancel).await, Err(SemError::Exhausted { .. })));

		drop(a);
		assert_eq!(sem.available(), 1);
		let _d = sem.acquire(&cancel).await?;
		assert_eq!(sem.available(), 0);
		Ok(())
	}

	#[tokio::test]
	async fn cancel_beats_wait() {
		let sem = TimedSemaphore::new(1, Duration::from_secs(30));
		let cancel = CancellationToken::new();
		let _held = sem.acquire(&cancel).await.unwrap();

		let waiter = {
			let sem = sem.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move { sem.acquire(&cancel).await })
		};
		cancel.cancel();
		let res = waiter.await.unwrap();
		assert!(matches!(res, Err(SemError::Cancelled)));
	}

	#[tokio::test]
	async fn try_acquire_never_blocks() {
		let sem = TimedSemaphore::new(1, Duration::from_secs(1));
		let held = sem.try_acquire();
		assert!(held.is_some());
		assert!(sem.try_acquire().is_none());
		drop(held);
		assert!(sem.try_acquire().is_some());
	}
}
