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

fn main() {
    // Libraries the runners load bind their `malloc` to the runner's own.
    for bin in ["heapbox_runner", "heapbox_testguest"] {
        println!("cargo:rustc-link-arg-bin={bin}=-Wl,--export-dynamic");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
