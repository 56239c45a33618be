// Kernel-to-kernel context switch and the drop into ring 3.

use core::arch::global_asm;

use crate::arch::IntRegs;

/// Words pushed onto a fresh kernel stack by [`prepare_kernel_stack`]:
/// return address plus the four callee-saved registers.
const INITIAL_FRAME_WORDS: usize = 5;

global_asm!(
    r#"
// context_switch(prev_sp: *mut usize, prev_bp: *mut usize, next_sp: usize)
//
// Saves the callee-saved state of the outgoing kernel thread on its own
// stack, records its stack/base pointers in the PCB slots the caller passed,
// then adopts the incoming stack and returns on it.
.globl context_switch
context_switch:
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 20]
    mov [eax], esp
    mov eax, [esp + 24]
    mov [eax], ebp
    mov ecx, [esp + 28]
    mov esp, ecx
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

// enter_user(regs: *const IntRegs) -> !
//
// Builds an IRET frame from a saved register block and resumes ring 3.
.globl enter_user
enter_user:
    mov ebp, [esp + 4]
    movzx eax, word ptr [ebp + 60]
    push eax                        // ss
    push dword ptr [ebp + 56]       // esp
    push dword ptr [ebp + 52]       // eflags
    movzx eax, word ptr [ebp + 48]
    push eax                        // cs
    push dword ptr [ebp + 44]       // eip
    movzx eax, word ptr [ebp + 34]
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ds, ax
    mov edi, [ebp + 4]
    mov esi, [ebp + 8]
    mov edx, [ebp + 12]
    mov ecx, [ebp + 16]
    mov ebx, [ebp + 20]
    mov eax, [ebp + 24]
    mov ebp, [ebp + 0]
    iretd
"#
);

extern "C" {
    pub fn context_switch(prev_sp: *mut usize, prev_bp: *mut usize, next_sp: usize);
    pub fn enter_user(regs: *const IntRegs) -> !;
}

/// Seed a fresh kernel stack so the first [`context_switch`] into it
/// "returns" to `entry`. Returns the initial (sp, bp) pair for the PCB.
pub fn prepare_kernel_stack(stack_top: usize, entry: extern "C" fn() -> !) -> (usize, usize) {
    let sp = stack_top - INITIAL_FRAME_WORDS * core::mem::size_of::<usize>();
    let frame = sp as *mut usize;
    unsafe {
        frame.add(0).write(0); // edi
        frame.add(1).write(0); // esi
        frame.add(2).write(0); // ebx
        frame.add(3).write(0); // ebp
        frame.add(4).write(entry as usize);
    }
    (sp, 0)
}
