//! The built in stages.
//!
//! | Stage | Role |
//! |---|---|
//! | [`pass`] | answers errors, redirects, OPTIONS and TRACE |
//! | [`file`] | serves, replaces and deletes static files |
//! | [`dir`] | directory listings |
//! | [`chunk`] | chunked transfer coding in both directions |
//! | [`range`] | byte range responses |
//! | [`net`] | vectored socket writes |
//! | [`send`] | file regions handed to [`Transport::send_file`](crate::Transport::send_file) |

pub(crate) mod chunk;
pub(crate) mod dir;
pub(crate) mod file;
pub(crate) mod net;
pub(crate) mod pass;
pub(crate) mod range;
pub(crate) mod send;
