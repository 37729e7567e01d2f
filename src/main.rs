// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use triptych::*;

#[cfg(test)]
mod test;

// We have these tests external from the crate for two reasons:
//
//  1. to make sure the public API is usable without accidentally relying on
//     crate-level-visibility stuff.
//
//  2. they drive whole simulated clusters through the protocol, which is a
//     different sort of thing from the unit tests living inside the crate's
//     modules.

#[test]
fn basic_commit() {
    test::basic_commit();
}

#[test]
fn basic_abort() {
    test::basic_abort();
}

#[test]
fn easy_recovery() {
    test::easy_recovery();
}

#[test]
fn relevance() {
    test::relevance();
}

#[test]
fn concurrent_different_keys() {
    test::concurrent_different_keys();
}

#[test]
fn concurrent_read_same_keys() {
    test::concurrent_read_same_keys();
}

#[test]
fn concurrent_write_same_keys() {
    test::concurrent_write_same_keys();
}

#[test]
fn serializability() {
    test::serializability();
}

#[test]
fn disconnect_pre_commit() {
    test::disconnect_pre_commit();
}

#[test]
fn disconnect_commit() {
    test::disconnect_commit();
}

#[test]
fn restart_pre_commit() {
    test::restart_pre_commit();
}

#[test]
fn restart_commit() {
    test::restart_commit();
}

#[test]
fn restart_mid_pre_commit() {
    test::restart_mid_pre_commit();
}

#[test]
fn restart_mid_commit() {
    test::restart_mid_commit();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
