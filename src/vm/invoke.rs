//! Method invocation: argument transfer, dispatch, frame entry, native
//! calls and `invokedynamic` call-site linking.

use std::sync::Arc;

use crate::error::VmError;

use super::bootstrap::names;
use super::class::{BootstrapDef, Class, ClassId, Constant, HandleKind, Method};
use super::exception::{Control, Exec, GuestError, Trap};
use super::frame::{Frame, Locals, ResultSink};
use super::heap::ObjectRef;
use super::interpreter::Thread;
use super::resolver::{LinkError, LinkResult, Resolver};
use super::value::Value;

/// Which `invoke*` instruction is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Static,
    Special,
    Virtual,
    Interface,
    Dynamic,
}

/// What entering a method produced.
pub(crate) enum Entered {
    /// A bytecode frame was pushed and must be run.
    Frame,
    /// A native method already ran to completion.
    Native(Option<Value>),
}

// ========================================
// Call-site linking
// ========================================

/// An `invokedynamic` instruction's call site, as seen by a linker.
#[derive(Debug)]
pub struct CallSite<'a> {
    pub class: &'a Class,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub bootstrap: &'a BootstrapDef,
}

/// Binds an `invokedynamic` call site to a target method. Called once per
/// site; the result is cached for every later execution.
pub trait BootstrapLinker: Send + Sync {
    fn link(&self, resolver: &Resolver<'_>, site: &CallSite<'_>) -> LinkResult<Arc<Method>>;
}

/// Links a site to a static method named by a method handle: the first
/// handle among the bootstrap arguments, else the bootstrap method itself.
/// The target must take exactly the site's descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantCallSiteLinker;

fn bootstrap_error(message: String) -> LinkError {
    GuestError::new(names::BOOTSTRAP_METHOD, message).into()
}

impl BootstrapLinker for ConstantCallSiteLinker {
    fn link(&self, resolver: &Resolver<'_>, site: &CallSite<'_>) -> LinkResult<Arc<Method>> {
        let pool = &site.class.constants;
        let handle = site
            .bootstrap
            .arguments
            .iter()
            .copied()
            .find(|i| matches!(pool.get(*i), Some(Constant::MethodHandle { .. })))
            .unwrap_or(site.bootstrap.method);
        let Some(Constant::MethodHandle { kind, member }) = pool.get(handle) else {
            return Err(VmError::BadConstant {
                class: site.class.name.clone(),
                index: handle,
                expected: "method handle",
            }
            .into());
        };
        if *kind != HandleKind::InvokeStatic {
            return Err(bootstrap_error(format!(
                "call site {} cannot bind a {:?} handle",
                site.name, kind
            )));
        }

        let owner = resolver.registry().load(&member.class)?;
        let target = resolver.lookup_method(&owner, member, owner.is_interface())?;
        if !target.is_static() {
            return Err(bootstrap_error(format!(
                "call site target {} is not static",
                target.qualified_name()
            )));
        }
        if target.descriptor != site.descriptor {
            return Err(bootstrap_error(format!(
                "call site {}{} does not match target {}",
                site.name,
                site.descriptor,
                target.qualified_name()
            )));
        }
        Ok(target)
    }
}

// ========================================
// Invocation
// ========================================

impl Thread {
    /// Execute one `invoke*` instruction at `pc` of `caller`.
    pub(crate) fn invoke_site(
        &mut self,
        caller: &Arc<Method>,
        pc: usize,
        kind: DispatchKind,
        index: u16,
    ) -> Exec<Control> {
        let vm = Arc::clone(&self.vm);
        let class = vm.registry.get(caller.class)?;

        let (target, args) = match kind {
            DispatchKind::Static => {
                let resolved = self.resolve_method(&class, index)?;
                if !resolved.is_static() {
                    return Err(self.raise(GuestError::new(
                        names::INCOMPATIBLE_CLASS_CHANGE,
                        format!("Expected static method {}", resolved.qualified_name()),
                    )));
                }
                let owner = vm.registry.get(resolved.class)?;
                self.ensure_initialized(&owner)?;
                let args = self.frame()?.pop_args(resolved.arg_count())?;
                (resolved, args)
            }
            DispatchKind::Special | DispatchKind::Virtual | DispatchKind::Interface => {
                let resolved = self.resolve_method(&class, index)?;
                if resolved.is_static() {
                    return Err(self.raise(GuestError::new(
                        names::INCOMPATIBLE_CLASS_CHANGE,
                        format!("Expected instance method {}", resolved.qualified_name()),
                    )));
                }
                let args = self.frame()?.pop_args(resolved.arg_count())?;
                let receiver = self.receiver(&resolved, &args)?;
                let target = if kind == DispatchKind::Special {
                    Resolver::new(&vm.registry)
                        .select_special(&class, &resolved)
                        .map_err(|e| self.link_error(e))?
                } else {
                    let receiver_class = vm.heap.class_of(receiver)?;
                    self.select_cached(caller, pc, kind, receiver_class, &resolved)?
                };
                (target, args)
            }
            DispatchKind::Dynamic => {
                let target = self.link_call_site(&class, index)?;
                let owner = vm.registry.get(target.class)?;
                self.ensure_initialized(&owner)?;
                let args = self.frame()?.pop_args(target.arg_count())?;
                (target, args)
            }
        };

        match self.enter(target, args, ResultSink::Caller)? {
            Entered::Frame => {}
            Entered::Native(value) => {
                if let Some(value) = value {
                    self.frame()?.push(value)?;
                }
            }
        }
        Ok(Control::Continue)
    }

    fn receiver(&mut self, method: &Method, args: &[Value]) -> Exec<ObjectRef> {
        match args.first() {
            Some(Value::Ref(Some(obj))) => Ok(*obj),
            Some(Value::Ref(None)) => Err(self.raise(GuestError::new(
                names::NULL_POINTER,
                format!(
                    "Cannot invoke \"{}.{}()\" because the receiver is null",
                    method.class_name.replace('/', "."),
                    method.name
                ),
            ))),
            other => Err(VmError::TypeMismatch {
                method: method.qualified_name(),
                expected: "reference",
                found: other.map_or("nothing", |v| v.type_name()),
            }
            .into()),
        }
    }

    /// Virtual or interface selection through the call site's inline cache.
    fn select_cached(
        &mut self,
        caller: &Method,
        pc: usize,
        kind: DispatchKind,
        receiver: ClassId,
        resolved: &Arc<Method>,
    ) -> Exec<Arc<Method>> {
        let cache = caller.site_cache(pc);
        if let Some(hit) = cache.and_then(|c| c.lock().check(receiver)) {
            return Ok(hit);
        }

        let vm = Arc::clone(&self.vm);
        let resolver = Resolver::new(&vm.registry);
        let selected = match kind {
            DispatchKind::Interface => resolver.select_interface(receiver, resolved),
            _ => resolver.select_virtual(receiver, resolved),
        };
        let selected = selected.map_err(|e| self.link_error(e))?;
        if let Some(cache) = cache {
            cache.lock().update(receiver, Arc::clone(&selected));
        }
        Ok(selected)
    }

    /// Target of an `invokedynamic` site, linking it on first execution.
    fn link_call_site(&mut self, class: &Class, index: u16) -> Exec<Arc<Method>> {
        let Some(Constant::InvokeDynamic {
            bootstrap,
            name,
            descriptor,
            call_site,
        }) = class.constants.get(index)
        else {
            return Err(VmError::BadConstant {
                class: class.name.clone(),
                index,
                expected: "invokedynamic",
            }
            .into());
        };
        if let Some(target) = call_site.get() {
            return Ok(Arc::clone(target));
        }

        let bootstrap = class
            .bootstrap_methods
            .get(*bootstrap as usize)
            .ok_or(VmError::BadConstant {
                class: class.name.clone(),
                index,
                expected: "bootstrap method",
            })?;
        let site = CallSite {
            class,
            name,
            descriptor,
            bootstrap,
        };
        let vm = Arc::clone(&self.vm);
        let linked = match vm.linker.link(&Resolver::new(&vm.registry), &site) {
            Ok(target) => target,
            Err(LinkError::Guest(e)) if e.class != names::BOOTSTRAP_METHOD => {
                return Err(self.raise(GuestError::new(names::BOOTSTRAP_METHOD, e.to_string())));
            }
            Err(e) => return Err(self.link_error(e)),
        };
        tracing::debug!(
            class = %class.name,
            site = %name,
            target = %linked.qualified_name(),
            "linked call site"
        );
        Ok(Arc::clone(call_site.get_or_init(|| linked)))
    }

    // ----------------------------------------
    // Frame entry
    // ----------------------------------------

    /// Start executing `method` with `args` already popped. Bytecode
    /// methods get a frame; natives run to completion here.
    pub(crate) fn enter(
        &mut self,
        method: Arc<Method>,
        args: Vec<Value>,
        sink: ResultSink,
    ) -> Exec<Entered> {
        let vm = Arc::clone(&self.vm);
        if self.frames.len() >= vm.config.max_call_depth {
            tracing::debug!(method = %method.qualified_name(), depth = self.frames.len(), "call depth limit");
            return Err(self.raise(GuestError::bare(names::STACK_OVERFLOW)));
        }
        if method.is_abstract() {
            return Err(self.raise(GuestError::new(
                names::ABSTRACT_METHOD,
                method.qualified_name(),
            )));
        }
        if vm.config.trace_calls {
            tracing::info!(
                target: "kettle::calls",
                method = %method.qualified_name(),
                depth = self.frames.len(),
                thread = self.id(),
                "call"
            );
        }

        let monitor = if method.is_synchronized() {
            Some(self.lock_for(&method, &args)?)
        } else {
            None
        };
        if method.is_native() {
            return self.enter_native(method, args, monitor);
        }

        let locals = match Locals::from_args(method.max_locals, &args) {
            Ok(locals) => locals,
            Err(fault) => {
                self.release(monitor);
                return Err(fault.in_method(&method).into());
            }
        };
        let mut frame = Frame::new(method, locals, sink);
        frame.monitor = monitor;
        self.frames.push(frame);
        Ok(Entered::Frame)
    }

    /// Monitor of the receiver, or of the class mirror for static methods.
    fn lock_for(&mut self, method: &Method, args: &[Value]) -> Exec<ObjectRef> {
        let obj = if method.is_static() {
            let class = self.vm.registry.get(method.class)?;
            self.mirror(&class)?
        } else {
            self.receiver(method, args)?
        };
        self.vm.monitors.get(obj).enter(self.id());
        Ok(obj)
    }

    fn release(&self, monitor: Option<ObjectRef>) {
        if let Some(obj) = monitor {
            let _ = self.vm.monitors.get(obj).exit(self.id());
        }
    }

    fn enter_native(
        &mut self,
        method: Arc<Method>,
        args: Vec<Value>,
        monitor: Option<ObjectRef>,
    ) -> Exec<Entered> {
        let vm = Arc::clone(&self.vm);
        let Some(handler) = vm.natives.get(&method.class_name, &method.name, &method.descriptor)
        else {
            self.release(monitor);
            return Err(self.raise(GuestError::new(
                names::UNSATISFIED_LINK,
                method.qualified_name(),
            )));
        };

        // The native frame only exists so backtraces show the native call.
        let slots = args.iter().map(|v| v.category().slots()).sum();
        let locals = Locals::from_args(slots, &args).map_err(|f| f.in_method(&method))?;
        let depth = self.frames.len();
        self.frames
            .push(Frame::new(Arc::clone(&method), locals, ResultSink::Host));

        let result = handler(self, &args);
        if let Err(Trap::Fatal(_)) = result {
            return result.map(Entered::Native);
        }
        let native = self.frames.drain(depth..).next();
        let released = match monitor {
            Some(obj) => vm.monitors.get(obj).exit(self.id()).is_ok(),
            None => true,
        };

        match result {
            Ok(value) if released => Ok(Entered::Native(value)),
            Ok(_) => Err(self.raise(GuestError::bare(names::ILLEGAL_MONITOR_STATE))),
            Err(Trap::Throw(mut signal)) => {
                if let Some(frame) = native {
                    signal.backtrace.push(frame.trace_element());
                }
                Err(Trap::Throw(signal))
            }
            Err(fatal) => Err(fatal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::{AccessFlags, ClassDef, ConstantDef, Flag, MethodDef};
    use crate::vm::ops::Instruction;
    use crate::vm::registry::testing::{class_def, registry};

    fn static_method(name: &str, descriptor: &str) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: AccessFlags::from(vec![Flag::Public, Flag::Static]),
            max_stack: 2,
            max_locals: 2,
            code: vec![Instruction::Iload(0), Instruction::Ireturn],
            ..Default::default()
        }
    }

    fn site_class(arguments: Vec<u16>, descriptor: &str) -> ClassDef {
        let mut def = class_def("demo/Site", None, &[]);
        def.methods = vec![static_method("twice", "(I)I")];
        def.constants = vec![
            ConstantDef::MethodHandle(
                HandleKind::InvokeStatic,
                "demo/Site".to_string(),
                "twice".to_string(),
                "(I)I".to_string(),
            ),
            ConstantDef::InvokeDynamic(0, "apply".to_string(), descriptor.to_string()),
            ConstantDef::MethodHandle(
                HandleKind::InvokeVirtual,
                "demo/Site".to_string(),
                "twice".to_string(),
                "(I)I".to_string(),
            ),
        ];
        def.bootstrap_methods = vec![BootstrapDef {
            method: 1,
            arguments,
        }];
        def
    }

    fn link(def: ClassDef) -> LinkResult<Arc<Method>> {
        let registry = registry(vec![def]);
        let class = registry.load("demo/Site").unwrap();
        let site = CallSite {
            class: &class,
            name: "apply",
            descriptor: "(I)I",
            bootstrap: &class.bootstrap_methods[0],
        };
        ConstantCallSiteLinker.link(&Resolver::new(&registry), &site)
    }

    #[test]
    fn test_links_to_static_handle() {
        let target = link(site_class(vec![], "(I)I")).unwrap();
        assert_eq!(target.name, "twice");
        assert!(target.is_static());
    }

    #[test]
    fn test_prefers_handle_argument() {
        let err = link(site_class(vec![3], "(I)I")).unwrap_err();
        match err {
            LinkError::Guest(e) => assert_eq!(e.class, names::BOOTSTRAP_METHOD),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_mismatch_is_bootstrap_error() {
        let mut def = site_class(vec![], "(I)I");
        def.methods = vec![static_method("twice", "(J)I")];
        if let ConstantDef::MethodHandle(_, _, _, d) = &mut def.constants[0] {
            *d = "(J)I".to_string();
        }
        match link(def).unwrap_err() {
            LinkError::Guest(e) => {
                assert_eq!(e.class, names::BOOTSTRAP_METHOD);
                assert!(e.message.unwrap().contains("does not match"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
