/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use async_trait::async_trait;

use crate::Descriptor;
use crate::DeviceSource;
use crate::FilterClass;
use crate::Result;

/// Source used in containers and on hosts without a device manager: no
/// devices are ever enumerated or reported, so every query resolves as
/// unavailable while the control surface stays up.
#[derive(Debug, Default)]
pub struct DummySource;

#[async_trait(?Send)]
impl DeviceSource for DummySource {
    fn enumerate(&mut self) -> Result<Vec<(FilterClass, Descriptor)>> {
        Ok(Vec::new())
    }

    async fn next_event(&mut self) -> Result<(FilterClass, Descriptor)> {
        std::future::pending().await
    }
}
