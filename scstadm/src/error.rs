use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScstError {
    #[error("{file}:{line}:{col}: {msg}\n    {excerpt}")]
    Parse {
        file: String,
        line: usize,
        col: usize,
        msg: String,
        excerpt: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("LUN {lun} in '{scope}' refers to undeclared device '{device}'")]
    LunNoDevice {
        scope: String,
        lun: u64,
        device: String,
    },
    #[error("target group '{group}' refers to unknown target '{target}'")]
    GroupNoTarget { group: String, target: String },
    #[error("device '{device}' is assigned to device groups '{first}' and '{second}'")]
    DeviceGroupConflict {
        device: String,
        first: String,
        second: String,
    },

    #[error("no SCST control filesystem found; is the scst module loaded?")]
    NoModule,
    #[error("failed to load required kernel module '{0}'")]
    ModuleLoadFail(String),

    #[error("No such handler '{0}' exists.")]
    NoHandler(String),
    #[error("No such device '{0}' exists.")]
    NoDevice(String),
    #[error("No such driver '{0}' exists.")]
    NoDriver(String),
    #[error("No such target '{0}' exists.")]
    NoTarget(String),
    #[error("No such group '{0}' exists.")]
    NoGroup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("SCST attribute '{0}' specified is static")]
    AttrStatic(String),
    #[error("failed to set attribute '{path}' to '{value}': {status}")]
    SetAttrFail {
        path: String,
        value: String,
        status: String,
    },
    #[error("management command '{cmd}' on '{path}' failed: {status}")]
    MgmtFail {
        path: String,
        cmd: String,
        status: String,
    },
    #[error("operation on '{path}' timed out after {secs}s")]
    Timeout { path: String, secs: u64 },

    #[error("converged with {} operation error(s)", .errors.len())]
    Partial { errors: Vec<ScstError> },
    #[error("convergence cancelled")]
    Cancelled,

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}
