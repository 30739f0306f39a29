//! Guest CPU architectures and their per-architecture launch policy.

use crate::error::VmError;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Guest architecture of a disk image.
///
/// Each variant knows which QEMU system emulator runs it, which machine and
/// firmware it needs and which NIC model its guests can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I386,
    Aarch64,
    Arm,
    Riscv64,
    Ppc64,
}

/// NIC model attached to every guest network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicModel {
    /// virtio-net on a PCI bus
    VirtioPci,
    /// virtio-net on the MMIO transport
    VirtioMmio,
    /// Intel e1000 emulation
    E1000,
    /// PAPR virtual LAN for pseries machines
    SpaprVlan,
}

impl NicModel {
    /// QEMU device name for `model=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::VirtioPci => "virtio-net-pci",
            NicModel::VirtioMmio => "virtio-net-device",
            NicModel::E1000 => "e1000",
            NicModel::SpaprVlan => "spapr-vlan",
        }
    }
}

impl Arch {
    /// Every supported architecture.
    pub const ALL: [Arch; 6] = [
        Arch::X86_64,
        Arch::I386,
        Arch::Aarch64,
        Arch::Arm,
        Arch::Riscv64,
        Arch::Ppc64,
    ];

    /// Canonical tag, as used in QEMU binary names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I386 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64 => "ppc64",
        }
    }

    /// Name of the system emulator binary.
    pub fn binary(&self) -> String {
        format!("qemu-system-{}", self.as_str())
    }

    /// Machine type, for architectures without a usable default board.
    pub fn machine(&self) -> Option<&'static str> {
        match self {
            Arch::Aarch64 | Arch::Arm | Arch::Riscv64 => Some("virt"),
            _ => None,
        }
    }

    /// UEFI firmware image, for architectures that cannot boot a cloud image
    /// from the emulator's built-in firmware.
    pub fn firmware(&self) -> Option<&'static Path> {
        match self {
            Arch::Aarch64 => Some(Path::new("/usr/share/qemu-efi-aarch64/QEMU_EFI.fd")),
            Arch::Arm => Some(Path::new("/usr/share/AAVMF/AAVMF32_CODE.fd")),
            _ => None,
        }
    }

    /// NIC model guests of this architecture can drive.
    pub fn nic_model(&self) -> NicModel {
        match self {
            Arch::X86_64 | Arch::Aarch64 | Arch::Riscv64 => NicModel::VirtioPci,
            Arch::Arm => NicModel::VirtioMmio,
            Arch::I386 => NicModel::E1000,
            Arch::Ppc64 => NicModel::SpaprVlan,
        }
    }

    /// Architecture of the running host, if it is one we can launch.
    pub fn host() -> Option<Arch> {
        std::env::consts::ARCH.parse().ok()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "i386" | "i686" => Ok(Arch::I386),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "arm" | "armv7l" | "armhf" => Ok(Arch::Arm),
            "riscv64" => Ok(Arch::Riscv64),
            "ppc64" | "ppc64le" | "powerpc64" => Ok(Arch::Ppc64),
            _ => Err(VmError::UnsupportedArch(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("AMD64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("ppc64le".parse::<Arch>().unwrap(), Arch::Ppc64);
        assert!(matches!(
            "sparc".parse::<Arch>(),
            Err(VmError::UnsupportedArch(_))
        ));
    }

    #[test]
    fn test_round_trip_tag() {
        for arch in Arch::ALL {
            assert_eq!(arch.as_str().parse::<Arch>().unwrap(), arch);
        }
    }

    #[test]
    fn test_binary_name() {
        assert_eq!(Arch::X86_64.binary(), "qemu-system-x86_64");
        assert_eq!(Arch::Aarch64.binary(), "qemu-system-aarch64");
    }

    #[test]
    fn test_uefi_architectures() {
        assert!(Arch::Aarch64.firmware().is_some());
        assert_eq!(Arch::Aarch64.machine(), Some("virt"));
        assert!(Arch::X86_64.firmware().is_none());
        assert!(Arch::X86_64.machine().is_none());
    }

    #[test]
    fn test_legacy_nic_models() {
        assert_eq!(Arch::X86_64.nic_model(), NicModel::VirtioPci);
        assert_eq!(Arch::I386.nic_model().as_str(), "e1000");
        assert_eq!(Arch::Ppc64.nic_model().as_str(), "spapr-vlan");
    }
}
