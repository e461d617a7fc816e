mod helpers;
mod test_coroutine;
mod test_debugger;
mod test_host;
mod test_vm_basic;
mod test_vm_calls;
