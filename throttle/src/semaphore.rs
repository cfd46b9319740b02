/// A token bucket on top of a tokio semaphore. A bucket created with zero capacity is disabled and
/// never blocks.
pub struct Semaphore {
    enabled: bool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self {
            enabled: value > 0,
            sem: tokio::sync::Semaphore::new(value.min(tokio::sync::Semaphore::MAX_PERMITS)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.enabled {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self) {
        if self.enabled {
            if let Ok(permit) = self.sem.acquire().await {
                permit.forget();
            }
        }
    }

    pub async fn consume_many(&self, value: u32) {
        if self.enabled {
            if let Ok(permit) = self.sem.acquire_many(value).await {
                permit.forget();
            }
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn run_replenish(&self, replenish: usize, interval: std::time::Duration) {
        if !self.enabled {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
