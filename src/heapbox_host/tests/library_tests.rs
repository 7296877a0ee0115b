/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Loads `heapbox_testlib` through the real runner.

use std::os::unix::process::ExitStatusExt;

use heapbox_host::HeapboxError;
use heapbox_testlib::{ADD_TYPE, index};
use serial_test::serial;

pub mod common; // pub to disable dead_code warning
use crate::common::{new_frame, new_library_sandbox};

#[test]
#[serial]
fn calls_reach_the_loaded_library() {
    let mut sandbox = new_library_sandbox();
    let frame = new_frame(&mut sandbox);
    frame.set(&sandbox, 1, 20);
    frame.set(&sandbox, 2, 22);
    sandbox.call_checked(index::ADD, ADD_TYPE, frame.0).unwrap();
    assert_eq!(frame.get(&sandbox, 0), 42);
    assert!(sandbox.shutdown().unwrap().success());
}

#[test]
#[serial]
fn a_crashing_library_is_detected() {
    let mut sandbox = new_library_sandbox();
    let frame = new_frame(&mut sandbox);
    match sandbox.call(index::CRASH, frame.0) {
        Err(HeapboxError::ChildExited(status)) => assert_eq!(status.signal(), Some(libc::SIGABRT)),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(!sandbox.is_running());
}

#[test]
#[serial]
fn library_malloc_lands_in_the_sandbox_heap() {
    let mut sandbox = new_library_sandbox();
    let frame = new_frame(&mut sandbox);
    sandbox.call(index::MALLOC42, frame.0).unwrap();
    let addr = frame.get(&sandbox, 1) as usize;
    let ptr = sandbox.range().checked_ptr(addr, 42).unwrap();
    let mut bytes = [0u8; 42];
    sandbox.read_bytes(ptr, &mut bytes).unwrap();
    assert_eq!(bytes, [0x2a; 42]);

    // and the library can free it again
    frame.set(&sandbox, 0, addr as u64);
    sandbox.call(index::FREE, frame.0).unwrap();
    assert!(sandbox.is_running());
}

#[test]
#[serial]
fn library_type_encodings_are_visible_to_the_host() {
    let mut sandbox = new_library_sandbox();
    assert_eq!(sandbox.type_encoding(index::ADD).unwrap().as_deref(), Some(ADD_TYPE));
    assert_eq!(sandbox.type_encoding(index::FREE).unwrap(), None);
    let frame = new_frame(&mut sandbox);
    assert!(matches!(
        sandbox.call_checked(index::CRASH, ADD_TYPE, frame.0),
        Err(HeapboxError::FunctionTypeMismatch(_, _, Some(_)))
    ));
    // a refused call never reaches the child
    assert!(sandbox.is_running());
}
