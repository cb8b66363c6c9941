//! Depth-first traversal of a repository tree

use crate::error::{RegistryError, Result};
use crate::reference::Repository;
use crate::remote::Options;
use crate::remote::list::{Tags, list};
use tracing::debug;

/// Visit `root` and every descendant repository the registry reports as a
/// child, parents before children and siblings in listing order.
///
/// `visit` receives each repository with its tags, or with the error that
/// listing it produced. Returning `Err` stops the walk and is passed back to
/// the caller; returning `Ok` after a listing error skips that subtree.
pub async fn walk<F>(root: &Repository, options: &Options, mut visit: F) -> Result<()>
where
    F: FnMut(&Repository, Result<&Tags>) -> Result<()>,
{
    let mut stack = vec![root.clone()];
    while let Some(repository) = stack.pop() {
        if options.cancel_token().is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        match list(&repository, options).await {
            Ok(tags) => {
                visit(&repository, Ok(&tags))?;
                debug!(repository = %repository, children = tags.children.len(), "walked repository");
                for child in tags.children.iter().rev() {
                    stack.push(repository.child(child)?);
                }
            }
            Err(RegistryError::Canceled) => return Err(RegistryError::Canceled),
            Err(e) => visit(&repository, Err(e))?,
        }
    }
    Ok(())
}
