// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The real thing: USB0 on a Kinetis K20/K64.
//!
//! USB-FS registers are eight bits wide on a four-byte stride. Status
//! registers are write-one-to-clear.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::bdt::BufferDescriptorTable;
use crate::hw::{Control, EndpointFlags, Errors, Interrupts, Transaction, UsbHardware};
use crate::NUM_ENDPOINTS;

#[repr(C)]
struct EndpointRegister {
    endpt: ReadWrite<u8>,
    _reserved: [u8; 3],
}

register_structs! {
    /// USB-FS controller, device-mode registers.
    UsbRegisters {
        (0x000 => _reserved0),
        (0x010 => otgistat: ReadWrite<u8>),
        (0x011 => _reserved1),
        (0x080 => istat: ReadWrite<u8>),
        (0x081 => _reserved2),
        (0x084 => inten: ReadWrite<u8>),
        (0x085 => _reserved3),
        (0x088 => errstat: ReadWrite<u8>),
        (0x089 => _reserved4),
        (0x08C => erren: ReadWrite<u8>),
        (0x08D => _reserved5),
        /// Head of the four-deep token FIFO.
        (0x090 => stat: ReadOnly<u8>),
        (0x091 => _reserved6),
        (0x094 => ctl: ReadWrite<u8>),
        (0x095 => _reserved7),
        (0x098 => addr: ReadWrite<u8, ADDR::Register>),
        (0x099 => _reserved8),
        (0x09C => bdtpage1: ReadWrite<u8>),
        (0x09D => _reserved9),
        (0x0B0 => bdtpage2: ReadWrite<u8>),
        (0x0B1 => _reserved10),
        (0x0B4 => bdtpage3: ReadWrite<u8>),
        (0x0B5 => _reserved11),
        (0x0C0 => endpt: [EndpointRegister; NUM_ENDPOINTS]),
        (0x100 => usbctrl: ReadWrite<u8, USBCTRL::Register>),
        (0x101 => _reserved12),
        (0x108 => control: ReadWrite<u8, CONTROL::Register>),
        (0x109 => _reserved13),
        (0x10C => @END),
    },
    /// The slice of the System Integration Module that feeds USB0.
    SimRegisters {
        (0x000 => sopt2: ReadWrite<u32, SOPT2::Register>),
        (0x004 => _reserved0),
        (0x030 => scgc4: ReadWrite<u32, SCGC4::Register>),
        (0x034 => _reserved1),
        (0x044 => clkdiv2: ReadWrite<u32, CLKDIV2::Register>),
        (0x048 => @END),
    },
    MpuRegisters {
        (0x000 => _reserved0),
        /// Region descriptor 0 alternate access control.
        (0x800 => rgdaac0: ReadWrite<u32, RGDAAC::Register>),
        (0x804 => @END),
    },
    WdogRegisters {
        (0x000 => stctrlh: ReadWrite<u16, STCTRLH::Register>),
        (0x002 => _reserved0),
        (0x00E => unlock: ReadWrite<u16, UNLOCK::Register>),
        (0x010 => @END),
    }
}

register_bitfields![u8,
    ADDR [
        LSEN OFFSET(7) NUMBITS(1) [],
        ADDR OFFSET(0) NUMBITS(7) []
    ],
    USBCTRL [
        /// Transceiver suspended.
        SUSP OFFSET(7) NUMBITS(1) [],
        /// Weak pull-downs on D+ and D-.
        PDE OFFSET(6) NUMBITS(1) []
    ],
    CONTROL [
        /// D+ pull-up, which is what tells the host we're here.
        DPPULLUPNONOTG OFFSET(4) NUMBITS(1) []
    ]
];

register_bitfields![u32,
    SOPT2 [
        USBSRC OFFSET(18) NUMBITS(1) [],
        PLLFLLSEL OFFSET(16) NUMBITS(1) []
    ],
    SCGC4 [
        USBOTG OFFSET(18) NUMBITS(1) []
    ],
    CLKDIV2 [
        USBDIV OFFSET(1) NUMBITS(3) [],
        USBFRAC OFFSET(0) NUMBITS(1) []
    ],
    RGDAAC [
        /// Bus master 4 is the USB controller.
        M4RE OFFSET(25) NUMBITS(1) [],
        M4WE OFFSET(24) NUMBITS(1) []
    ]
];

register_bitfields![u16,
    STCTRLH [
        WAITEN OFFSET(7) NUMBITS(1) [],
        STOPEN OFFSET(6) NUMBITS(1) [],
        DBGEN OFFSET(5) NUMBITS(1) [],
        ALLOWUPDATE OFFSET(4) NUMBITS(1) [],
        WDOGEN OFFSET(0) NUMBITS(1) []
    ],
    UNLOCK [
        KEY OFFSET(0) NUMBITS(16) [
            Key1 = 0xC520,
            Key2 = 0xD928
        ]
    ]
];

const USB0_BASE: usize = 0x4007_2000;
const SIM_BASE: usize = 0x4004_8004;
#[cfg(target_os = "none")]
const WDOG_BASE: usize = 0x4005_2000;
#[cfg(not(feature = "target-mk20dx128"))]
const MPU_BASE: usize = 0x4000_D000;

fn usb0() -> &'static UsbRegisters {
    // Safety: USB0 is always mapped here, and the register types only do
    // volatile accesses.
    unsafe { &*(USB0_BASE as *const UsbRegisters) }
}

fn sim() -> &'static SimRegisters {
    // Safety: as for `usb0`.
    unsafe { &*(SIM_BASE as *const SimRegisters) }
}

#[cfg(target_os = "none")]
fn wdog() -> &'static WdogRegisters {
    // Safety: as for `usb0`.
    unsafe { &*(WDOG_BASE as *const WdogRegisters) }
}

/// The mk20dx128 has no MPU.
#[cfg(not(feature = "target-mk20dx128"))]
fn mpu() -> &'static MpuRegisters {
    // Safety: as for `usb0`.
    unsafe { &*(MPU_BASE as *const MpuRegisters) }
}

/// `BDTPAGE1..3` for a table at `address`. Bits 8:0 must be zero.
pub const fn bdt_pages(address: u32) -> [u8; 3] {
    [(address >> 8) as u8 & 0xFE, (address >> 16) as u8, (address >> 24) as u8]
}

/// `SIM_CLKDIV2` value that divides a PLL running at `pll_hz` down to the
/// 48 MHz the controller needs, if there is one.
pub const fn usb_clock_divider(pll_hz: u32) -> Option<u32> {
    // (USBDIV << 1) | USBFRAC, giving pll * (FRAC + 1) / (DIV + 1).
    match pll_hz {
        48_000_000 => Some(0),
        72_000_000 => Some(2 << 1 | 1),
        96_000_000 => Some(1 << 1),
        120_000_000 => Some(4 << 1 | 1),
        144_000_000 => Some(2 << 1),
        _ => None,
    }
}

/// Feeds the controller the PLL output through `divider`, from
/// [`usb_clock_divider`].
///
/// # Safety
///
/// Must run before [`UsbHardware::attach`], with the PLL locked.
pub unsafe fn select_usb_clock(divider: u32) {
    let sim = sim();
    sim.clkdiv2
        .write(CLKDIV2::USBDIV.val(divider >> 1) + CLKDIV2::USBFRAC.val(divider & 1));
    sim.sopt2
        .modify(SOPT2::USBSRC::SET + SOPT2::PLLFLLSEL::SET);
}

/// Turns off the watchdog, which comes out of reset running. The unlock
/// window closes a few hundred cycles after reset, so this belongs in
/// `pre_init`.
#[cfg(target_os = "none")]
pub fn disable_watchdog() {
    let wdog = wdog();
    wdog.unlock.write(UNLOCK::KEY::Key1);
    wdog.unlock.write(UNLOCK::KEY::Key2);
    // The unlock takes a bus cycle or two to land.
    cortex_m::asm::nop();
    cortex_m::asm::nop();
    // Disabled in every mode, still reconfigurable.
    wdog.stctrlh.write(
        STCTRLH::ALLOWUPDATE::SET
            + STCTRLH::WAITEN::CLEAR
            + STCTRLH::STOPEN::CLEAR
            + STCTRLH::DBGEN::CLEAR
            + STCTRLH::WDOGEN::CLEAR,
    );
}

/// Hands control to the ROM/debugger bootloader. On a Teensy the halfkay
/// loader picks up the breakpoint.
#[cfg(target_os = "none")]
pub fn reboot_into_bootloader() {
    cortex_m::asm::bkpt();
    loop {
        cortex_m::asm::nop();
    }
}

/// USB0, plus the BDT it has been pointed at.
pub struct Kinetis {
    table: BufferDescriptorTable,
}

impl Kinetis {
    /// # Safety
    ///
    /// There is one USB0. Only one `Kinetis` may exist, and it must not move
    /// once `attach` has given the controller the table's address.
    pub const unsafe fn new() -> Self {
        Self {
            table: BufferDescriptorTable::new(),
        }
    }
}

impl UsbHardware for Kinetis {
    fn table(&self) -> &BufferDescriptorTable {
        &self.table
    }

    fn attach(&self) {
        sim().scgc4.modify(SCGC4::USBOTG::SET);
        // The controller is a bus master, and the MPU shuts it out of RAM
        // until told otherwise.
        #[cfg(not(feature = "target-mk20dx128"))]
        mpu().rgdaac0.modify(RGDAAC::M4RE::SET + RGDAAC::M4WE::SET);

        let regs = usb0();
        let [page1, page2, page3] = bdt_pages(self.table.as_ptr() as u32);
        regs.bdtpage1.set(page1);
        regs.bdtpage2.set(page2);
        regs.bdtpage3.set(page3);

        regs.istat.set(0xFF);
        regs.errstat.set(0xFF);
        regs.otgistat.set(0xFF);

        regs.ctl.set(Control::USB_ENABLE.bits());
        // Undo the suspend and weak pull-downs the controller comes out of
        // reset with.
        regs.usbctrl.write(USBCTRL::SUSP::CLEAR + USBCTRL::PDE::CLEAR);
        regs.inten.set(Interrupts::USB_RESET.bits());
        regs.control.write(CONTROL::DPPULLUPNONOTG::SET);
    }

    fn interrupt_status(&self) -> Interrupts {
        let regs = usb0();
        Interrupts::from_bits_truncate(regs.istat.get() & regs.inten.get())
    }

    fn clear_interrupts(&self, which: Interrupts) {
        usb0().istat.set(which.bits());
    }

    fn enable_interrupts(&self, which: Interrupts) {
        usb0().inten.set(which.bits());
    }

    fn error_status(&self) -> Errors {
        Errors::from_bits_truncate(usb0().errstat.get())
    }

    fn clear_errors(&self, which: Errors) {
        usb0().errstat.set(which.bits());
    }

    fn enable_errors(&self, which: Errors) {
        usb0().erren.set(which.bits());
    }

    fn transaction_status(&self) -> Transaction {
        Transaction::from_stat(usb0().stat.get())
    }

    fn endpoint_control(&self, endpoint: usize) -> EndpointFlags {
        EndpointFlags::from_bits_truncate(usb0().endpt[endpoint].endpt.get())
    }

    fn set_endpoint_control(&self, endpoint: usize, flags: EndpointFlags) {
        usb0().endpt[endpoint].endpt.set(flags.bits());
    }

    fn address(&self) -> u8 {
        usb0().addr.read(ADDR::ADDR)
    }

    fn set_address(&self, address: u8) {
        usb0().addr.write(ADDR::ADDR.val(address & 0x7F));
    }

    fn set_control(&self, control: Control) {
        usb0().ctl.set(control.bits());
    }
}
