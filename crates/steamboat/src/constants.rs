// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub(crate) const ERR_POISONED_LOCK: &str =
    "poisoned lock - cannot continue execution because internal invariants can no longer be upheld";
