use crate::zygote::descriptors::WorkerDescriptors;

/// Start-up state handed to a freshly forked worker.
///
/// Replaces the process-wide command line the zygote inherited: the worker's
/// entry point receives this value instead of re-reading ambient state.
#[derive(Debug, Default)]
pub struct WorkerStartup {
    argv: Vec<String>,
    descriptors: WorkerDescriptors,
}

impl WorkerStartup {
    pub fn new(argv: Vec<String>, descriptors: WorkerDescriptors) -> Self {
        Self { argv, descriptors }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Value of a `--name=value` switch
    pub fn switch_value(&self, name: &str) -> Option<&str> {
        self.argv.iter().find_map(|arg| {
            arg.strip_prefix("--")?
                .strip_prefix(name)?
                .strip_prefix('=')
        })
    }

    /// Whether `--name` or `--name=...` was passed
    pub fn has_switch(&self, name: &str) -> bool {
        self.argv.iter().any(|arg| match arg.strip_prefix("--") {
            Some(rest) => rest == name || rest.strip_prefix(name).is_some_and(|v| v.starts_with('=')),
            None => false,
        })
    }

    /// The `--type=` switch the controller uses to name the worker role
    pub fn process_type(&self) -> Option<&str> {
        self.switch_value("type")
    }

    pub fn descriptors(&self) -> &WorkerDescriptors {
        &self.descriptors
    }

    pub fn descriptors_mut(&mut self) -> &mut WorkerDescriptors {
        &mut self.descriptors
    }

    pub fn into_parts(self) -> (Vec<String>, WorkerDescriptors) {
        (self.argv, self.descriptors)
    }
}
