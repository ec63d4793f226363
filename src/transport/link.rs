// firmfetch - Persistent download queue for telematics devices
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use super::NetworkLink;
use std::sync::atomic::{AtomicBool, Ordering};

/// Link status flag set by whoever owns the modem connection
#[derive(Debug, Default)]
pub struct SharedLink {
    attached: AtomicBool,
}

impl SharedLink {
    pub fn new(attached: bool) -> Self {
        Self {
            attached: AtomicBool::new(attached),
        }
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }
}

impl NetworkLink for SharedLink {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}
