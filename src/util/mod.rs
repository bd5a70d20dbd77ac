mod interval;
mod retry;

pub(crate) use self::interval::IntoPgInterval;
pub(crate) use self::retry::retry_fixed;
