use crate::job::JobTable;

pub struct State {
	pub jobs: &'static JobTable,
	pub interactive: bool,
}

impl State {
	pub fn new(jobs: &'static JobTable, interactive: bool) -> State {
		State { jobs, interactive }
	}
}
