use reelhouse_core::Scheduler;

#[derive(Clone, Debug)]
pub struct AppState {
    scheduler: Scheduler,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
