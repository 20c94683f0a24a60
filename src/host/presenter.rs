//! Seam to whatever actually shows an ask to the user

use super::session::DialogSession;

/// Creates and shows the interactive surface for an ask.
///
/// `present` returns once the surface exists; the user's eventual action is
/// reported through the [`DialogSession`]. An error means nothing was shown,
/// and the dispatcher cancels the ask on the requester's behalf.
pub trait Presenter: Send + Sync {
    fn present(&self, session: DialogSession) -> anyhow::Result<()>;
}

impl<F> Presenter for F
where
    F: Fn(DialogSession) -> anyhow::Result<()> + Send + Sync,
{
    fn present(&self, session: DialogSession) -> anyhow::Result<()> {
        self(session)
    }
}
