// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The two chain streamers. Each polls its chain from a resume cursor,
//! dispatches bridge contract events into the aggregator, and writes the
//! cursor back to the metadata store on cancellation only; a crash replays
//! a window, which the aggregator absorbs because its operations are
//! idempotent for an unchanged digest and signer set.

pub mod eth;
pub mod kaon;
