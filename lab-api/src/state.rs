use lab_orchestrator::Provisioner;

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Provisioner,
}

impl AppState {
    pub fn new(provisioner: Provisioner) -> Self {
        Self { provisioner }
    }
}
