/*!
The tarmac client core.

The layers here are stacked bottom-up, each using only those below it:

- [`netproto`] — the authenticated, encrypted TCP session and its packet
  framing;
- [`netpacket`] — typed request/response packets, the FIFO operation queue,
  and reconnection with backoff;
- [`storage`] — transactional put/get/delete of fixed-name files on the
  remote service, split into read, write, and delete cookies;
- [`chunks`] — the local content-addressed chunk directory with reference
  counts, compression, and verification;
- [`multitape`] — the three-stream archive format, its signed metadata and
  metaindex, and the create/extract/delete/fsck drivers.

Archive payloads enter and leave as opaque byte streams; producing tar
entries is a front-end concern.
*/

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::missing_errors_doc)]

pub mod chunks;
pub mod multitape;
pub mod netpacket;
pub mod netproto;
pub mod storage;
