pub(crate) mod poll;
pub(crate) mod watch;

pub(crate) use poll::poll;
pub(crate) use watch::watch;
